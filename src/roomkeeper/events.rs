use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_MESSAGE: &str = "m.room.message";
pub const EVENT_ENCRYPTED: &str = "m.room.encrypted";
pub const EVENT_STICKER: &str = "m.sticker";
pub const EVENT_REACTION: &str = "m.reaction";
pub const EVENT_REDACTION: &str = "m.room.redaction";
pub const STATE_ALIASES: &str = "m.room.aliases";
pub const STATE_CANONICAL_ALIAS: &str = "m.room.canonical_alias";
pub const STATE_TOPIC: &str = "m.room.topic";
pub const STATE_ROOM_NAME: &str = "m.room.name";
pub const STATE_MEMBER: &str = "m.room.member";
pub const EPHEMERAL_RECEIPT: &str = "m.receipt";
pub const EPHEMERAL_TYPING: &str = "m.typing";
pub const ACCOUNT_DATA_DIRECT_CHATS: &str = "m.direct";
pub const ACCOUNT_DATA_PUSH_RULES: &str = "m.push_rules";
pub const ACCOUNT_DATA_ROOM_TAGS: &str = "m.tag";
pub const ACCOUNT_DATA_PREFERENCES: &str = "app.roomkeeper.preferences";

/// Why an event is being delivered. A single event may carry several flags,
/// e.g. a membership event inside the timeline of a left room is
/// `TIMELINE | LEAVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceFlags(u8);

impl SourceFlags {
    pub const TIMELINE: SourceFlags = SourceFlags(1);
    pub const STATE: SourceFlags = SourceFlags(1 << 1);
    pub const LEAVE: SourceFlags = SourceFlags(1 << 2);
    pub const INVITE: SourceFlags = SourceFlags(1 << 3);
    pub const INITIAL: SourceFlags = SourceFlags(1 << 4);
    pub const ACCOUNT_DATA: SourceFlags = SourceFlags(1 << 5);
    pub const EPHEMERAL: SourceFlags = SourceFlags(1 << 6);
    pub const PRESENCE: SourceFlags = SourceFlags(1 << 7);

    pub const fn empty() -> Self {
        SourceFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when any of the bits in `other` are set.
    pub const fn contains(self, other: SourceFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for SourceFlags {
    type Output = SourceFlags;

    fn bitor(self, rhs: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SourceFlags {
    fn bitor_assign(&mut self, rhs: SourceFlags) {
        self.0 |= rhs.0;
    }
}

/// Delivery state of an event the local user originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingState {
    /// Not a local send, or a send from another device.
    #[default]
    None,
    /// Rendered locally, waiting for the server to echo it back.
    LocalEcho,
    /// The server echoed the event back with the matching transaction id.
    Confirmed,
    /// The transport rejected the send.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Unsigned {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content: Option<Value>,
}

/// A replacement recorded against the original event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub event_id: String,
    pub sender: String,
    pub timestamp: i64,
    /// Full replacement content.
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactionCause {
    pub event_id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: i64,
}

/// A room event as delivered by the server, plus the annotations folded onto
/// it by later relation events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event_id")]
    pub id: String,

    pub room_id: String,

    pub sender: String,

    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Server timestamp in milliseconds.
    #[serde(rename = "origin_server_ts")]
    pub timestamp: i64,

    #[serde(default)]
    pub content: Value,

    /// Target of a redaction event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,

    #[serde(default)]
    pub unsigned: Unsigned,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<Edit>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redaction_cause: Option<RedactionCause>,

    #[serde(default)]
    pub outgoing_state: OutgoingState,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        room_id: impl Into<String>,
        sender: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: i64,
        content: Value,
    ) -> Self {
        Self {
            id: id.into(),
            room_id: room_id.into(),
            sender: sender.into(),
            event_type: event_type.into(),
            state_key: None,
            timestamp,
            content,
            redacts: None,
            unsigned: Unsigned::default(),
            edits: Vec::new(),
            reactions: BTreeMap::new(),
            redacted_by: None,
            redaction_cause: None,
            outgoing_state: OutgoingState::None,
        }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Content to render: the latest edit wins over the original.
    pub fn rendered_content(&self) -> &Value {
        self.edits
            .last()
            .map(|edit| &edit.content)
            .unwrap_or(&self.content)
    }

    pub fn body(&self) -> Option<&str> {
        self.rendered_content().get("body").and_then(Value::as_str)
    }

    pub fn is_redacted(&self) -> bool {
        self.redacted_by.is_some()
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.unsigned.transaction_id.as_deref()
    }

    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default()
    }

    /// `content.membership` of a member event.
    pub fn membership(&self) -> Option<&str> {
        self.content.get("membership").and_then(Value::as_str)
    }

    /// `unsigned.prev_content.membership` of a member event.
    pub fn prev_membership(&self) -> Option<&str> {
        self.unsigned
            .prev_content
            .as_ref()
            .and_then(|prev| prev.get("membership"))
            .and_then(Value::as_str)
    }
}

/// Closed set of event types the router knows how to handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Encrypted,
    Sticker,
    Reaction,
    Redaction,
    RoomAliases,
    CanonicalAlias,
    Topic,
    RoomName,
    Member,
    Receipt,
    Typing,
    DirectChats,
    PushRules,
    Tag,
    Preferences,
    Unknown(String),
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            EVENT_MESSAGE => EventKind::Message,
            EVENT_ENCRYPTED => EventKind::Encrypted,
            EVENT_STICKER => EventKind::Sticker,
            EVENT_REACTION => EventKind::Reaction,
            EVENT_REDACTION => EventKind::Redaction,
            STATE_ALIASES => EventKind::RoomAliases,
            STATE_CANONICAL_ALIAS => EventKind::CanonicalAlias,
            STATE_TOPIC => EventKind::Topic,
            STATE_ROOM_NAME => EventKind::RoomName,
            STATE_MEMBER => EventKind::Member,
            EPHEMERAL_RECEIPT => EventKind::Receipt,
            EPHEMERAL_TYPING => EventKind::Typing,
            ACCOUNT_DATA_DIRECT_CHATS => EventKind::DirectChats,
            ACCOUNT_DATA_PUSH_RULES => EventKind::PushRules,
            ACCOUNT_DATA_ROOM_TAGS => EventKind::Tag,
            ACCOUNT_DATA_PREFERENCES => EventKind::Preferences,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}
