use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::{
    Event, STATE_ALIASES, STATE_CANONICAL_ALIAS, STATE_MEMBER, STATE_ROOM_NAME, STATE_TOPIC,
};

/// Order assigned to tags that don't specify one.
pub const DEFAULT_TAG_ORDER: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invite" => Some(Membership::Invite),
            "join" => Some(Membership::Join),
            "leave" => Some(Membership::Leave),
            "ban" => Some(Membership::Ban),
            "knock" => Some(Membership::Knock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomTag {
    pub label: String,
    pub order: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadMessage {
    pub event_id: String,
    /// Whether the message counts towards the unread badge.
    pub counted: bool,
    pub highlight: bool,
}

/// Per-conversation aggregate. Everything except the in-memory `loaded` and
/// `typing` fields is persisted by the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,

    #[serde(default)]
    pub members: HashMap<String, Member>,

    #[serde(default)]
    pub tags: Vec<RoomTag>,

    #[serde(skip)]
    pub typing: Vec<String>,

    #[serde(default)]
    pub last_read_event: Option<String>,

    #[serde(default)]
    pub unread_messages: Vec<UnreadMessage>,

    /// Pagination cursor marking the oldest locally fetched position.
    #[serde(default)]
    pub prev_batch: Option<String>,

    #[serde(default)]
    pub has_left: bool,

    #[serde(default)]
    pub members_fetched: bool,

    #[serde(skip)]
    pub loaded: bool,

    #[serde(default)]
    pub is_direct: bool,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub topic: Option<String>,

    #[serde(default)]
    pub canonical_alias: Option<String>,

    #[serde(default)]
    pub last_received_message: Option<DateTime<Utc>>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: HashMap::new(),
            tags: Vec::new(),
            typing: Vec::new(),
            last_read_event: None,
            unread_messages: Vec::new(),
            prev_batch: None,
            has_left: false,
            members_fetched: false,
            loaded: false,
            is_direct: false,
            name: None,
            topic: None,
            canonical_alias: None,
            last_received_message: None,
        }
    }

    /// Fold a state event into the aggregate. Unknown state types are ignored.
    pub fn update_state(&mut self, event: &Event) {
        match event.event_type.as_str() {
            STATE_MEMBER => {
                let Some(user_id) = event.state_key.as_deref() else {
                    return;
                };
                match event.membership().and_then(Membership::parse) {
                    Some(membership) => {
                        let display_name = event
                            .content
                            .get("displayname")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        self.members.insert(
                            user_id.to_string(),
                            Member {
                                membership,
                                display_name,
                            },
                        );
                    }
                    None => {
                        tracing::debug!(
                            target: "roomkeeper::rooms::update_state",
                            "Ignoring member event {} with unknown membership",
                            event.id
                        );
                    }
                }
            }
            STATE_ROOM_NAME => self.name = string_field(&event.content, "name"),
            STATE_TOPIC => self.topic = string_field(&event.content, "topic"),
            STATE_CANONICAL_ALIAS => {
                self.canonical_alias = string_field(&event.content, "alias")
            }
            STATE_ALIASES => {
                if self.canonical_alias.is_none() {
                    self.canonical_alias = event
                        .content
                        .get("aliases")
                        .and_then(Value::as_array)
                        .and_then(|aliases| aliases.first())
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
            }
            _ => {}
        }
    }

    pub fn membership_of(&self, user_id: &str) -> Option<Membership> {
        self.members.get(user_id).map(|member| member.membership)
    }

    /// Display title used by list views.
    pub fn title(&self) -> &str {
        self.name
            .as_deref()
            .or(self.canonical_alias.as_deref())
            .unwrap_or(&self.id)
    }

    pub fn load(&mut self) {
        if !self.has_left {
            self.loaded = true;
        }
    }

    pub fn unload(&mut self) {
        self.loaded = false;
    }

    /// Leaving evicts the timeline from memory; only the durable store keeps it.
    pub fn mark_left(&mut self) {
        self.has_left = true;
        self.unload();
    }

    pub fn mark_joined(&mut self) {
        self.has_left = false;
    }

    pub fn add_unread(&mut self, event_id: &str, counted: bool, highlight: bool) {
        self.unread_messages.push(UnreadMessage {
            event_id: event_id.to_string(),
            counted,
            highlight,
        });
    }

    /// Move the read marker, clearing unread entries up to and including
    /// `event_id`. Unknown ids clear everything.
    pub fn mark_read(&mut self, event_id: &str) {
        self.last_read_event = Some(event_id.to_string());
        match self
            .unread_messages
            .iter()
            .position(|unread| unread.event_id == event_id)
        {
            Some(index) => {
                self.unread_messages.drain(..=index);
            }
            None => self.unread_messages.clear(),
        }
    }

    pub fn unread_count(&self) -> usize {
        self.unread_messages
            .iter()
            .filter(|unread| unread.counted)
            .count()
    }

    pub fn highlighted(&self) -> bool {
        self.unread_messages.iter().any(|unread| unread.highlight)
    }

    /// Replace the tag list from an `m.tag` content object.
    pub fn set_tags_from_content(&mut self, content: &Value) {
        let mut tags: Vec<RoomTag> = content
            .get("tags")
            .and_then(Value::as_object)
            .map(|tags| {
                tags.iter()
                    .map(|(label, info)| RoomTag {
                        label: label.clone(),
                        order: info
                            .get("order")
                            .and_then(parse_order)
                            .unwrap_or(DEFAULT_TAG_ORDER),
                    })
                    .collect()
            })
            .unwrap_or_default();
        tags.sort_by(|a, b| {
            a.order
                .total_cmp(&b.order)
                .then_with(|| a.label.cmp(&b.label))
        });
        self.tags = tags;
    }
}

fn string_field(content: &Value, field: &str) -> Option<String> {
    content
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

// Servers send order either as a number or as a numeric string.
fn parse_order(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

/// All rooms the session knows about, keyed by id.
#[derive(Debug, Default)]
pub struct RoomList {
    rooms: HashMap<String, Room>,
}

impl RoomList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rooms(rooms: Vec<Room>) -> Self {
        Self {
            rooms: rooms.into_iter().map(|room| (room.id.clone(), room)).collect(),
        }
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn get_or_create(&mut self, room_id: &str) -> &mut Room {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Room> {
        self.rooms.values_mut()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Evict every timeline from memory.
    pub fn force_clean(&mut self) {
        for room in self.rooms.values_mut() {
            room.unload();
        }
    }

    /// Rooms to show in the room list, most recently active first.
    pub fn visible(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .rooms
            .values()
            .filter(|room| !room.has_left)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| {
            b.last_received_message
                .cmp(&a.last_received_message)
                .then_with(|| a.id.cmp(&b.id))
        });
        rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member_event(user: &str, membership: &str) -> Event {
        let mut event = Event::new(
            format!("$m-{user}-{membership}"),
            "!room",
            user,
            STATE_MEMBER,
            1,
            json!({"membership": membership, "displayname": "Someone"}),
        );
        event.state_key = Some(user.to_string());
        event
    }

    #[test]
    fn test_mark_left_evicts_timeline() {
        let mut room = Room::new("!room");
        room.load();
        assert!(room.loaded);

        room.mark_left();
        assert!(room.has_left);
        assert!(!room.loaded);

        // A left room can't be loaded until it's joined again
        room.load();
        assert!(!room.loaded);

        room.mark_joined();
        assert!(!room.has_left);
        room.load();
        assert!(room.loaded);
    }

    #[test]
    fn test_update_state_records_members() {
        let mut room = Room::new("!room");
        room.update_state(&member_event("@bob", "join"));
        assert_eq!(room.membership_of("@bob"), Some(Membership::Join));
        assert_eq!(
            room.members["@bob"].display_name.as_deref(),
            Some("Someone")
        );

        room.update_state(&member_event("@bob", "leave"));
        assert_eq!(room.membership_of("@bob"), Some(Membership::Leave));

        // Unknown membership values leave the map untouched
        room.update_state(&member_event("@bob", "wandering"));
        assert_eq!(room.membership_of("@bob"), Some(Membership::Leave));
    }

    #[test]
    fn test_update_state_name_topic_alias() {
        let mut room = Room::new("!room");
        assert_eq!(room.title(), "!room");

        let aliases = Event::new(
            "$a",
            "!room",
            "@bob",
            STATE_ALIASES,
            1,
            json!({"aliases": ["#first:example.org", "#second:example.org"]}),
        );
        room.update_state(&aliases);
        assert_eq!(room.title(), "#first:example.org");

        let name = Event::new("$n", "!room", "@bob", STATE_ROOM_NAME, 2, json!({"name": "Lounge"}));
        room.update_state(&name);
        assert_eq!(room.title(), "Lounge");

        let topic = Event::new("$t", "!room", "@bob", STATE_TOPIC, 3, json!({"topic": "chat"}));
        room.update_state(&topic);
        assert_eq!(room.topic.as_deref(), Some("chat"));
    }

    #[test]
    fn test_unread_tracking() {
        let mut room = Room::new("!room");
        room.add_unread("$1", true, false);
        room.add_unread("$2", false, false);
        room.add_unread("$3", true, true);

        assert_eq!(room.unread_count(), 2);
        assert!(room.highlighted());

        room.mark_read("$2");
        assert_eq!(room.last_read_event.as_deref(), Some("$2"));
        assert_eq!(room.unread_count(), 1);
        assert!(room.highlighted());

        room.mark_read("$unknown");
        assert_eq!(room.unread_count(), 0);
        assert!(!room.highlighted());
    }

    #[test]
    fn test_tags_sorted_with_default_order() {
        let mut room = Room::new("!room");
        room.set_tags_from_content(&json!({
            "tags": {
                "u.work": {"order": 0.9},
                "m.favourite": {},
                "u.friends": {"order": "0.1"}
            }
        }));

        let labels: Vec<&str> = room.tags.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["u.friends", "m.favourite", "u.work"]);
        assert_eq!(room.tags[1].order, DEFAULT_TAG_ORDER);

        room.set_tags_from_content(&json!({}));
        assert!(room.tags.is_empty());
    }

    #[test]
    fn test_room_list_visible_and_force_clean() {
        let mut rooms = RoomList::new();
        rooms.get_or_create("!a").load();
        rooms.get_or_create("!b").mark_left();
        let c = rooms.get_or_create("!c");
        c.last_received_message = DateTime::from_timestamp_millis(5000);
        c.load();

        let visible: Vec<String> = rooms.visible().into_iter().map(|r| r.id).collect();
        assert_eq!(visible, vec!["!c".to_string(), "!a".to_string()]);

        rooms.force_clean();
        assert!(rooms.iter().all(|room| !room.loaded));
        assert_eq!(rooms.len(), 3);
    }

    #[test]
    fn test_room_persistence_skips_memory_fields() {
        let mut room = Room::new("!room");
        room.load();
        room.typing = vec!["@bob".to_string()];
        room.prev_batch = Some("t1".to_string());

        let json = serde_json::to_string(&room).unwrap();
        let restored: Room = serde_json::from_str(&json).unwrap();
        assert!(!restored.loaded);
        assert!(restored.typing.is_empty());
        assert_eq!(restored.prev_batch.as_deref(), Some("t1"));
    }
}
