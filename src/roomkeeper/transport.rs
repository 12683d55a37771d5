use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::{Event, SourceFlags};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The access token was rejected. The session is over.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Anything that may succeed on retry: timeouts, 5xx, dropped connections.
    #[error("Transient transport failure: {0}")]
    Transient(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// A single delivered event together with why it was delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedEvent {
    pub source: SourceFlags,
    pub event: Event,
}

impl SyncedEvent {
    pub fn new(source: SourceFlags, event: Event) -> Self {
        Self { source, event }
    }
}

/// One incremental delta from the server, already flattened into delivery
/// order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncBatch {
    pub next_batch: String,
    pub events: Vec<SyncedEvent>,
    /// Pagination token preceding each room's timeline in this batch.
    #[serde(default)]
    pub prev_batches: HashMap<String, String>,
}

/// A page of older history.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessagesPage {
    /// Newest first, as returned by a backward pagination request.
    pub chunk: Vec<Event>,
    /// State events needed to render the chunk.
    #[serde(default)]
    pub state: Vec<Event>,
    /// Token for the next (older) page.
    pub end: Option<String>,
}

/// Network side of the client. Authentication and the wire protocol live
/// behind this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Long-poll for the next batch after `since`.
    async fn sync(&self, since: Option<&str>) -> Result<SyncBatch, TransportError>;

    /// Returns the server-assigned event id.
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        transaction_id: &str,
    ) -> Result<String, TransportError>;

    async fn redact(
        &self,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
        transaction_id: &str,
    ) -> Result<String, TransportError>;

    async fn set_typing(
        &self,
        room_id: &str,
        typing: bool,
        timeout_ms: u64,
    ) -> Result<(), TransportError>;

    async fn mark_read(&self, room_id: &str, event_id: &str) -> Result<(), TransportError>;

    async fn messages(
        &self,
        room_id: &str,
        from: Option<&str>,
        limit: usize,
    ) -> Result<MessagesPage, TransportError>;

    async fn get_event(&self, room_id: &str, event_id: &str) -> Result<Event, TransportError>;

    /// Current member state events of a room.
    async fn members(&self, room_id: &str) -> Result<Vec<Event>, TransportError>;

    /// Returns the id of the joined room.
    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, TransportError>;

    async fn leave_room(&self, room_id: &str) -> Result<(), TransportError>;

    async fn logout(&self) -> Result<(), TransportError>;
}
