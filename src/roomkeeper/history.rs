use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::database::DatabaseError;
use super::events::Event;
use super::preferences::Preferences;
use super::rooms::Room;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Event {event_id} not found in room {room_id}")]
    NotFound { room_id: String, event_id: String },

    #[error("History store is closed")]
    Closed,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HistoryError {
    pub fn not_found(room_id: &str, event_id: &str) -> Self {
        HistoryError::NotFound {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        }
    }

    /// Missing targets are expected (relations to unseen events, cache
    /// misses) and never fatal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HistoryError::NotFound { .. })
    }
}

impl From<sqlx::Error> for HistoryError {
    fn from(err: sqlx::Error) -> Self {
        HistoryError::Database(DatabaseError::Sqlx(err))
    }
}

/// Session bookkeeping that survives restarts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub next_batch: Option<String>,
    pub initial_sync_done: bool,
    pub preferences: Preferences,
}

/// In-place mutation applied by [`HistoryStore::update`].
pub type EventMutation<'a> = &'a mut (dyn FnMut(&mut Event) + Send);

/// Durable per-room event log and the session state stored alongside it.
///
/// This is the only component that touches persistent storage. Every
/// mutation of an existing event goes through [`HistoryStore::update`].
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Add events to the tail of the room's timeline. Returns the records
    /// that were newly stored; ids already present are skipped.
    async fn append(&self, room_id: &str, events: Vec<Event>) -> Result<Vec<Event>, HistoryError>;

    /// Insert older events (oldest first) before the current head. Ids
    /// already present are skipped.
    async fn prepend(&self, room_id: &str, events: Vec<Event>)
    -> Result<Vec<Event>, HistoryError>;

    /// Fetch, mutate and persist a stored event.
    async fn update(
        &self,
        room_id: &str,
        event_id: &str,
        mutate: EventMutation<'_>,
    ) -> Result<Event, HistoryError>;

    async fn get(&self, room_id: &str, event_id: &str) -> Result<Event, HistoryError>;

    /// Delete a stored event. Removing an absent event is not an error.
    async fn remove(&self, room_id: &str, event_id: &str) -> Result<(), HistoryError>;

    /// Page backward through the cached timeline: the first call returns the
    /// `limit` newest events, later calls return older ones. An empty result
    /// is a cache miss.
    async fn load(&self, room_id: &str, limit: usize) -> Result<Vec<Event>, HistoryError>;

    /// Restart paging for [`HistoryStore::load`] from the newest event.
    async fn rewind(&self, room_id: &str);

    async fn save_room(&self, room: &Room) -> Result<(), HistoryError>;

    async fn load_rooms(&self) -> Result<Vec<Room>, HistoryError>;

    async fn load_sync_state(&self) -> Result<SyncState, HistoryError>;

    async fn save_sync_state(&self, state: &SyncState) -> Result<(), HistoryError>;

    /// Forget everything belonging to the logged-in session.
    async fn clear_session(&self) -> Result<(), HistoryError>;

    /// Whether a relation event was already folded into the log.
    async fn is_processed(&self, room_id: &str, event_id: &str) -> Result<bool, HistoryError>;

    async fn mark_processed(&self, room_id: &str, event_id: &str) -> Result<(), HistoryError>;

    /// Flush and release resources. Safe to call more than once.
    async fn close(&self) -> Result<(), HistoryError>;
}
