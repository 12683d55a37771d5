use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{
    Mutex,
    mpsc::{self, Sender},
    oneshot,
};
use tokio::task::JoinHandle;

pub mod database;
pub mod error;
mod event_processor;
pub mod events;
pub mod history;
pub mod local_echo;
pub mod media;
pub mod messages;
pub mod notifications;
pub mod preferences;
pub mod relations;
pub mod rooms;
pub mod tasks;
pub mod timeline;
pub mod transport;
pub mod typing;
pub mod ui;

use crate::init_tracing;

use database::{Database, SqliteHistoryStore};
use error::{Result, RoomkeeperError};
use event_processor::{SyncContext, WorkerCommand};
pub use event_processor::WorkerExit;
use history::HistoryStore;
use media::MediaCache;
use notifications::PushRuleEvaluator;
use rooms::{Room, RoomList};
use tasks::BackgroundTasks;
use transport::Transport;
use typing::TypingDebouncer;
use ui::UiSink;

const DEFAULT_COMMAND_BUFFER: usize = 64;
const DEFAULT_SYNC_ERROR_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct RoomkeeperConfig {
    /// Directory for the history database and media cache
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Fully qualified id of the logged-in user
    pub user_id: String,

    /// Base URL media is downloaded from
    pub homeserver_url: String,

    /// Pause after a failed sync before polling again
    pub sync_error_delay: Duration,

    /// Capacity of the command channel into the sync worker
    pub command_buffer: usize,
}

impl RoomkeeperConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path, user_id: &str, homeserver_url: &str) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            user_id: user_id.to_string(),
            homeserver_url: homeserver_url.to_string(),
            sync_error_delay: DEFAULT_SYNC_ERROR_DELAY,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }

    /// Build a configuration from `ROOMKEEPER_*` environment variables,
    /// loading a `.env` file first if there is one.
    pub fn from_env() -> Result<Self> {
        if dotenvy::dotenv().is_err() {
            tracing::debug!(
                target: "roomkeeper::config::from_env",
                "No .env file found, using process environment only"
            );
        }

        let data_dir = env_or("ROOMKEEPER_DATA_DIR", "./data");
        let logs_dir = env_or("ROOMKEEPER_LOGS_DIR", "./logs");
        let user_id = required_env("ROOMKEEPER_USER_ID")?;
        let homeserver_url = required_env("ROOMKEEPER_HOMESERVER_URL")?;

        let mut config = Self::new(
            Path::new(&data_dir),
            Path::new(&logs_dir),
            &user_id,
            &homeserver_url,
        );
        if let Some(secs) = parsed_env::<u64>("ROOMKEEPER_SYNC_ERROR_DELAY_SECS")? {
            config.sync_error_delay = Duration::from_secs(secs);
        }
        if let Some(buffer) = parsed_env::<usize>("ROOMKEEPER_COMMAND_BUFFER")? {
            config.command_buffer = buffer.max(1);
        }
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("roomkeeper.sqlite")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RoomkeeperError::Configuration(format!("{key} is not set")))
}

fn parsed_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| RoomkeeperError::Configuration(format!("{key} has invalid value {value:?}"))),
        Err(_) => Ok(None),
    }
}

/// A running client session: the sync worker plus the API that feeds it.
pub struct Roomkeeper {
    pub config: RoomkeeperConfig,
    history: Arc<dyn HistoryStore>,
    transport: Arc<dyn Transport>,
    media: MediaCache,
    tasks: Arc<BackgroundTasks>,
    typing: TypingDebouncer,
    command_sender: Sender<WorkerCommand>,
    shutdown_sender: Sender<()>,
    worker: Mutex<Option<JoinHandle<WorkerExit>>>,
}

impl std::fmt::Debug for Roomkeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Roomkeeper")
            .field("config", &self.config)
            .field("history", &"<REDACTED>")
            .field("transport", &"<REDACTED>")
            .finish()
    }
}

impl Roomkeeper {
    /// Open the session stored under `config.data_dir` and start syncing.
    ///
    /// Sets up the data and log directories, logging, and the history
    /// database, restores rooms and the sync token from a previous run, and
    /// spawns the sync worker. Failing to open the store is fatal.
    pub async fn initialize(
        config: RoomkeeperConfig,
        transport: Arc<dyn Transport>,
        ui: Arc<dyn UiSink>,
        push_rules: Arc<dyn PushRuleEvaluator>,
    ) -> Result<Self> {
        let data_dir = &config.data_dir;
        let logs_dir = &config.logs_dir;

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))
            .map_err(RoomkeeperError::from)?;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(RoomkeeperError::from)?;

        init_tracing(logs_dir);

        tracing::debug!(
            target: "roomkeeper::initialize",
            "Logging initialized in directory: {:?}",
            logs_dir
        );

        let database = Database::new(config.database_path()).await?;
        let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::new(database));

        Self::start(config, history, transport, ui, push_rules).await
    }

    /// Spawn the sync worker over an already opened store.
    pub(crate) async fn start(
        config: RoomkeeperConfig,
        history: Arc<dyn HistoryStore>,
        transport: Arc<dyn Transport>,
        ui: Arc<dyn UiSink>,
        push_rules: Arc<dyn PushRuleEvaluator>,
    ) -> Result<Self> {
        let rooms = history.load_rooms().await?;
        let sync_state = history.load_sync_state().await?;
        tracing::info!(
            target: "roomkeeper::start",
            "Restored {} rooms for {} (initial sync done: {})",
            rooms.len(),
            config.user_id,
            sync_state.initial_sync_done
        );

        let (command_sender, command_receiver) = mpsc::channel(config.command_buffer);
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);
        let tasks = Arc::new(BackgroundTasks::new());

        let context = SyncContext::new(
            config.user_id.clone(),
            RoomList::from_rooms(rooms),
            sync_state,
            history.clone(),
            transport.clone(),
            ui,
            push_rules,
            tasks.clone(),
            config.sync_error_delay,
        );
        let worker = tokio::spawn(context.run(command_receiver, shutdown_receiver));

        Ok(Self {
            media: MediaCache::new(&config.homeserver_url, config.media_dir()),
            config,
            history,
            transport,
            tasks,
            typing: TypingDebouncer::new(),
            command_sender,
            shutdown_sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Send a command to the sync worker and wait for its reply.
    pub(crate) async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command_sender
            .send(build(reply))
            .await
            .map_err(|_| RoomkeeperError::WorkerUnavailable)?;
        response.await.map_err(|_| RoomkeeperError::WorkerUnavailable)
    }

    /// Snapshot of every room that hasn't been left.
    pub async fn rooms(&self) -> Result<Vec<Room>> {
        self.request(|reply| WorkerCommand::Rooms { reply }).await
    }

    /// Join a room by id or alias. Returns the joined room's id.
    pub async fn join_room(&self, room_id_or_alias: &str) -> Result<String> {
        let room_id = self.transport.join_room(room_id_or_alias).await?;
        let joined = room_id.clone();
        self.request(|reply| WorkerCommand::MarkJoined {
            room_id: joined,
            reply,
        })
        .await?;
        Ok(room_id)
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        self.transport.leave_room(room_id).await?;
        self.request(|reply| WorkerCommand::MarkLeft {
            room_id: room_id.to_string(),
            reply,
        })
        .await
    }

    /// Fetch the full member list of a room from the server.
    pub async fn fetch_members(&self, room_id: &str) -> Result<()> {
        let members = self.transport.members(room_id).await?;
        tracing::debug!(
            target: "roomkeeper::fetch_members",
            "Fetched {} members for {}",
            members.len(),
            room_id
        );
        self.request(|reply| WorkerCommand::ApplyMembers {
            room_id: room_id.to_string(),
            members,
            reply,
        })
        .await
    }

    /// Path of the cached copy of an `mxc://` URI, downloading it if needed.
    pub async fn download_media(&self, uri: &str) -> Result<PathBuf> {
        Ok(self.media.download(uri).await?)
    }

    /// Warm the media cache in the background.
    pub fn prefetch_media(&self, uri: &str) {
        let media = self.media.clone();
        let uri = uri.to_string();
        self.tasks.spawn("prefetch_media", async move {
            if let Err(e) = media.download(&uri).await {
                tracing::debug!(
                    target: "roomkeeper::prefetch_media",
                    "Failed to prefetch {}: {}",
                    uri,
                    e
                );
            }
        });
    }

    /// End the session on the server and wipe everything stored locally.
    pub async fn logout(&self) -> Result<()> {
        self.request(|reply| WorkerCommand::Logout { reply }).await?;
        self.join_worker().await;
        Ok(())
    }

    /// Stop syncing and close the store. Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        // Fails only if the worker is already gone
        let _ = self.shutdown_sender.send(()).await;
        self.tasks.abort_all();
        self.join_worker().await;
        Ok(())
    }

    async fn join_worker(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        match worker.await {
            Ok(exit) => tracing::debug!(
                target: "roomkeeper::join_worker",
                "Sync worker finished: {:?}",
                exit
            ),
            Err(e) => tracing::error!(
                target: "roomkeeper::join_worker",
                "Sync worker panicked: {}",
                e
            ),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::test_utils::*;
    use super::*;
    use crate::roomkeeper::events::SourceFlags;
    use crate::roomkeeper::ui::UiUpdate;

    #[test]
    fn test_config_uses_build_suffix() {
        let config = RoomkeeperConfig::new(Path::new("/data"), Path::new("/logs"), ME, "https://hs");
        let suffix = if cfg!(debug_assertions) { "dev" } else { "release" };
        assert_eq!(config.data_dir, Path::new("/data").join(suffix));
        assert_eq!(config.logs_dir, Path::new("/logs").join(suffix));
        assert_eq!(config.database_path(), config.data_dir.join("roomkeeper.sqlite"));
        assert_eq!(config.command_buffer, DEFAULT_COMMAND_BUFFER);
    }

    #[tokio::test]
    async fn test_initialize_creates_directories_and_database() {
        let (config, _data, _logs) = create_test_config();
        let client = Roomkeeper::initialize(
            config.clone(),
            Arc::new(MockTransport::default()),
            Arc::new(ui::BroadcastUi::new()),
            Arc::new(StaticPushRules::notify()),
        )
        .await
        .unwrap();

        assert!(config.data_dir.exists());
        assert!(config.logs_dir.exists());
        assert!(config.database_path().exists());
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_fails_when_data_dir_is_unusable() {
        let (mut config, data, _logs) = create_test_config();
        // A plain file where the data directory should be
        let blocker = data.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        config.data_dir = blocker;

        let result = Roomkeeper::initialize(
            config,
            Arc::new(MockTransport::default()),
            Arc::new(ui::BroadcastUi::new()),
            Arc::new(StaticPushRules::notify()),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_worker() {
        let test = create_test_client(MockTransport::default()).await;
        test.client.stop().await.unwrap();
        test.client.stop().await.unwrap();
        assert!(matches!(
            test.client.rooms().await,
            Err(RoomkeeperError::WorkerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_rooms_reflect_synced_state() {
        let transport = MockTransport::with_syncs(vec![Ok(batch(
            "s1",
            vec![(
                SourceFlags::TIMELINE,
                membership("$join", ME, "join", None),
            )],
        ))]);
        let mut test = create_test_client(transport).await;

        // The first batch ends the initial phase and publishes the room list
        let rooms = loop {
            let rooms = test.client.rooms().await.unwrap();
            if !rooms.is_empty() {
                break rooms;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(rooms[0].id, ROOM);

        test.client.stop().await.unwrap();
        let updates = drain_updates(&mut test.updates);
        assert!(
            updates
                .iter()
                .any(|update| matches!(update, UiUpdate::RoomsReplaced(rooms) if rooms.len() == 1))
        );
    }

    #[tokio::test]
    async fn test_join_and_leave_room() {
        let test = create_test_client(MockTransport::default()).await;

        let room_id = test.client.join_room("#chat:example.org").await.unwrap();
        assert_eq!(room_id, ROOM);
        assert_eq!(test.client.rooms().await.unwrap().len(), 1);

        test.client.leave_room(ROOM).await.unwrap();
        assert!(test.client.rooms().await.unwrap().is_empty());
        assert_eq!(*test.transport.left.lock().unwrap(), vec![ROOM.to_string()]);
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_members_records_member_state() {
        let transport = MockTransport::default();
        *transport.members.lock().unwrap() = vec![
            membership("$m1", ME, "join", None),
            membership("$m2", ALICE, "join", None),
        ];
        let test = create_test_client(transport).await;

        test.client.fetch_members(ROOM).await.unwrap();
        let rooms = test.client.rooms().await.unwrap();
        assert!(rooms[0].members_fetched);
        assert_eq!(rooms[0].members.len(), 2);
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_clears_session_and_stops_worker() {
        let mut test = create_test_client(MockTransport::default()).await;
        test.client.join_room(ROOM).await.unwrap();

        test.client.logout().await.unwrap();
        assert_eq!(test.transport.logouts.load(Ordering::SeqCst), 1);
        assert!(
            drain_updates(&mut test.updates)
                .iter()
                .any(|update| matches!(update, UiUpdate::LoggedOut))
        );
        assert!(test.client.rooms().await.is_err());
        // Stopping after logout is a no-op
        test.client.stop().await.unwrap();
    }
}
