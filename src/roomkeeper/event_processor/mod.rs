//! The sync worker.
//!
//! A single task owns the [`SyncContext`] and performs every room and store
//! mutation, so per-room ordering holds without locks. It long-polls the
//! transport, routes each delivered event to its handler, and serves
//! [`WorkerCommand`]s from the public API between batches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;

use super::events::Event;
use super::history::{HistoryStore, SyncState};
use super::local_echo::LocalEchoReconciler;
use super::notifications::{NotificationGate, PushRuleEvaluator};
use super::rooms::RoomList;
use super::tasks::BackgroundTasks;
use super::transport::{SyncBatch, Transport, TransportError};
use super::ui::UiSink;

mod commands;
mod event_handlers;
mod router;

pub(crate) use commands::{EchoOutcome, HistoryPage, WorkerCommand};

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    LoggedOut,
}

/// Everything the sync worker owns.
pub(crate) struct SyncContext {
    pub(crate) user_id: String,
    pub(crate) rooms: RoomList,
    pub(crate) history: Arc<dyn HistoryStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) ui: Arc<dyn UiSink>,
    pub(crate) push_rules: Arc<dyn PushRuleEvaluator>,
    pub(crate) gate: NotificationGate,
    pub(crate) echoes: LocalEchoReconciler,
    pub(crate) sync_state: SyncState,
    pub(crate) tasks: Arc<BackgroundTasks>,
    pub(crate) sync_error_delay: Duration,
    /// Rooms whose persisted snapshot is stale.
    dirty_rooms: HashSet<String>,
}

impl SyncContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        user_id: String,
        rooms: RoomList,
        sync_state: SyncState,
        history: Arc<dyn HistoryStore>,
        transport: Arc<dyn Transport>,
        ui: Arc<dyn UiSink>,
        push_rules: Arc<dyn PushRuleEvaluator>,
        tasks: Arc<BackgroundTasks>,
        sync_error_delay: Duration,
    ) -> Self {
        Self {
            user_id,
            rooms,
            history,
            transport,
            ui,
            push_rules,
            gate: NotificationGate::new(sync_state.initial_sync_done),
            echoes: LocalEchoReconciler::new(),
            sync_state,
            tasks,
            sync_error_delay,
            dirty_rooms: HashSet::new(),
        }
    }

    /// Run until shutdown or logout, then close the history store.
    pub(crate) async fn run(
        mut self,
        mut commands: Receiver<WorkerCommand>,
        mut shutdown: Receiver<()>,
    ) -> WorkerExit {
        tracing::debug!(
            target: "roomkeeper::event_processor::run",
            "Starting sync worker for {}",
            self.user_id
        );

        if self.gate.is_live() {
            // Cached session: the room list is already complete.
            self.ui.set_rooms(&self.rooms.visible());
        }

        let transport = self.transport.clone();
        let mut commands_open = true;

        let exit = loop {
            let since = self.sync_state.next_batch.clone();
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!(
                        target: "roomkeeper::event_processor::run",
                        "Received shutdown signal"
                    );
                    break WorkerExit::Stopped;
                }
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => {
                            if let Some(exit) = self.handle_command(command).await {
                                break exit;
                            }
                        }
                        None => commands_open = false,
                    }
                }
                result = transport.sync(since.as_deref()) => {
                    match result {
                        Ok(batch) => self.process_batch(batch).await,
                        Err(TransportError::Unauthorized(reason)) => {
                            tracing::warn!(
                                target: "roomkeeper::event_processor::run",
                                "Sync rejected as unauthorized, logging out: {}",
                                reason
                            );
                            self.logout().await;
                            break WorkerExit::LoggedOut;
                        }
                        Err(e) => {
                            tracing::warn!(
                                target: "roomkeeper::event_processor::run",
                                "Sync failed, retrying: {}",
                                e
                            );
                            if self.pause_after_error(&mut shutdown).await {
                                break WorkerExit::Stopped;
                            }
                        }
                    }
                }
            }
        };

        if let Err(e) = self.history.close().await {
            tracing::warn!(
                target: "roomkeeper::event_processor::run",
                "Failed to close history store: {}",
                e
            );
        }
        tracing::debug!(
            target: "roomkeeper::event_processor::run",
            "Sync worker exited: {:?}",
            exit
        );
        exit
    }

    /// Sleep for the configured error delay. Returns true if shutdown was
    /// requested meanwhile.
    async fn pause_after_error(&self, shutdown: &mut Receiver<()>) -> bool {
        if self.sync_error_delay.is_zero() {
            return false;
        }
        tokio::select! {
            biased;
            _ = shutdown.recv() => true,
            _ = tokio::time::sleep(self.sync_error_delay) => false,
        }
    }

    pub(crate) async fn process_batch(&mut self, batch: SyncBatch) {
        tracing::debug!(
            target: "roomkeeper::event_processor::process_batch",
            "Processing batch {} with {} events",
            batch.next_batch,
            batch.events.len()
        );

        for (room_id, prev_batch) in batch.prev_batches {
            let room = self.rooms.get_or_create(&room_id);
            // Only the oldest known gap matters for scrollback
            if room.prev_batch.is_none() {
                room.prev_batch = Some(prev_batch);
                self.touch(&room_id);
            }
        }

        for synced in batch.events {
            self.dispatch(synced.source, synced.event).await;
        }

        self.sync_state.next_batch = Some(batch.next_batch);

        if self.gate.is_live() {
            self.flush_dirty_rooms().await;
            self.persist_sync_state().await;
        } else {
            self.finish_initial_sync().await;
        }
    }

    /// Switch to the live regime after the first complete batch.
    pub(crate) async fn finish_initial_sync(&mut self) {
        if !self.gate.finish_initial_sync() {
            return;
        }
        self.sync_state.initial_sync_done = true;

        self.rooms.force_clean();
        for room in self.rooms.iter() {
            self.history.rewind(&room.id).await;
            if let Err(e) = self.history.save_room(room).await {
                tracing::warn!(
                    target: "roomkeeper::event_processor::finish_initial_sync",
                    "Failed to save room {}: {}",
                    room.id,
                    e
                );
            }
        }
        self.dirty_rooms.clear();
        self.persist_sync_state().await;

        let visible = self.rooms.visible();
        tracing::info!(
            target: "roomkeeper::event_processor::finish_initial_sync",
            "Initial sync done, {} rooms visible",
            visible.len()
        );
        self.ui.set_rooms(&visible);
    }

    pub(crate) fn touch(&mut self, room_id: &str) {
        self.dirty_rooms.insert(room_id.to_string());
    }

    pub(crate) async fn flush_dirty_rooms(&mut self) {
        for room_id in std::mem::take(&mut self.dirty_rooms) {
            let Some(room) = self.rooms.get(&room_id) else {
                continue;
            };
            if let Err(e) = self.history.save_room(room).await {
                tracing::warn!(
                    target: "roomkeeper::event_processor::flush_dirty_rooms",
                    "Failed to save room {}: {}",
                    room_id,
                    e
                );
            }
        }
    }

    pub(crate) async fn persist_sync_state(&self) {
        if let Err(e) = self.history.save_sync_state(&self.sync_state).await {
            tracing::warn!(
                target: "roomkeeper::event_processor::persist_sync_state",
                "Failed to save sync state: {}",
                e
            );
        }
    }

    /// Whether relation updates for a room should reach the UI.
    pub(crate) fn shows_updates(&self, room_id: &str) -> bool {
        self.gate.is_live() && self.rooms.get(room_id).is_some_and(|room| room.loaded)
    }

    /// End the session: tell the server, wipe session data and notify the UI.
    pub(crate) async fn logout(&mut self) {
        if let Err(e) = self.transport.logout().await {
            tracing::debug!(
                target: "roomkeeper::event_processor::logout",
                "Server logout failed: {}",
                e
            );
        }
        if let Err(e) = self.history.clear_session().await {
            tracing::warn!(
                target: "roomkeeper::event_processor::logout",
                "Failed to clear session data: {}",
                e
            );
        }
        self.tasks.abort_all();
        self.echoes.clear();
        self.rooms = RoomList::new();
        self.dirty_rooms.clear();
        self.sync_state = SyncState::default();
        self.gate = NotificationGate::new(false);
        self.ui.on_logout();
    }

    /// Append an event to a room's stored timeline. A store failure is
    /// logged and the event is passed through so the UI still sees it.
    /// Returns `None` for duplicates.
    pub(crate) async fn store_event(&self, room_id: &str, event: Event) -> Option<Event> {
        match self.history.append(room_id, vec![event.clone()]).await {
            Ok(mut stored) => {
                let stored = stored.pop();
                if stored.is_none() {
                    tracing::debug!(
                        target: "roomkeeper::event_processor::store_event",
                        "Event {} already stored in {}",
                        event.id,
                        room_id
                    );
                }
                stored
            }
            Err(e) => {
                tracing::warn!(
                    target: "roomkeeper::event_processor::store_event",
                    "Failed to add event {} to history: {}",
                    event.id,
                    e
                );
                Some(event)
            }
        }
    }
}
