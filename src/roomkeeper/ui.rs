//! The presentation side of the client.
//!
//! The sync worker reports every visible change through [`UiSink`]. Callers
//! that don't want to implement the trait can use [`BroadcastUi`] and
//! subscribe to a stream of [`UiUpdate`] values instead.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::events::Event;
use super::notifications::PushVerdict;
use super::preferences::Preferences;
use super::rooms::Room;

/// Receiver of presentation updates. Calls are made from the sync worker
/// and must not block.
pub trait UiSink: Send + Sync {
    /// A room became visible (joined, invited, or woke up with a notifying message).
    fn materialize_room(&self, room: &Room);

    fn remove_room(&self, room_id: &str);

    fn append_to_timeline(&self, room: &Room, event: &Event);

    /// The echo shown under `transaction_id` is now the server event `event`.
    fn confirm_local_echo(&self, room_id: &str, transaction_id: &str, event: &Event);

    /// The server rejected a send.
    fn local_echo_failed(&self, room_id: &str, transaction_id: &str);

    /// `target` after the edit was folded in.
    fn add_edit(&self, room_id: &str, target: &Event);

    fn add_reaction(&self, room_id: &str, target: &Event, key: &str);

    /// `target` after scrubbing.
    fn add_redaction(&self, room_id: &str, target: &Event);

    fn set_typing(&self, room_id: &str, users: &[String]);

    fn alert(&self, room: &Room, event: &Event, verdict: PushVerdict);

    fn update_tags(&self, room: &Room);

    /// Full room list, sent once when the initial sync completes.
    fn set_rooms(&self, rooms: &[Room]);

    fn preferences_changed(&self, preferences: &Preferences);

    fn on_logout(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UiUpdate {
    RoomMaterialized(Room),
    RoomRemoved(String),
    TimelineAppended {
        room_id: String,
        event: Event,
    },
    LocalEchoConfirmed {
        room_id: String,
        transaction_id: String,
        event: Event,
    },
    LocalEchoFailed {
        room_id: String,
        transaction_id: String,
    },
    EventEdited {
        room_id: String,
        event: Event,
    },
    ReactionAdded {
        room_id: String,
        event: Event,
        key: String,
    },
    EventRedacted {
        room_id: String,
        event: Event,
    },
    Typing {
        room_id: String,
        users: Vec<String>,
    },
    Alert {
        room_id: String,
        event: Event,
        verdict: PushVerdict,
    },
    TagsUpdated(Room),
    RoomsReplaced(Vec<Room>),
    PreferencesChanged(Preferences),
    LoggedOut,
}

const BUFFER_SIZE: usize = 256;

/// [`UiSink`] that fans updates out to any number of subscribers.
pub struct BroadcastUi {
    sender: broadcast::Sender<UiUpdate>,
}

impl BroadcastUi {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(BUFFER_SIZE).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiUpdate> {
        self.sender.subscribe()
    }

    fn emit(&self, update: UiUpdate) {
        // No subscribers is fine
        let _ = self.sender.send(update);
    }
}

impl Default for BroadcastUi {
    fn default() -> Self {
        Self::new()
    }
}

impl UiSink for BroadcastUi {
    fn materialize_room(&self, room: &Room) {
        self.emit(UiUpdate::RoomMaterialized(room.clone()));
    }

    fn remove_room(&self, room_id: &str) {
        self.emit(UiUpdate::RoomRemoved(room_id.to_string()));
    }

    fn append_to_timeline(&self, room: &Room, event: &Event) {
        self.emit(UiUpdate::TimelineAppended {
            room_id: room.id.clone(),
            event: event.clone(),
        });
    }

    fn confirm_local_echo(&self, room_id: &str, transaction_id: &str, event: &Event) {
        self.emit(UiUpdate::LocalEchoConfirmed {
            room_id: room_id.to_string(),
            transaction_id: transaction_id.to_string(),
            event: event.clone(),
        });
    }

    fn local_echo_failed(&self, room_id: &str, transaction_id: &str) {
        self.emit(UiUpdate::LocalEchoFailed {
            room_id: room_id.to_string(),
            transaction_id: transaction_id.to_string(),
        });
    }

    fn add_edit(&self, room_id: &str, target: &Event) {
        self.emit(UiUpdate::EventEdited {
            room_id: room_id.to_string(),
            event: target.clone(),
        });
    }

    fn add_reaction(&self, room_id: &str, target: &Event, key: &str) {
        self.emit(UiUpdate::ReactionAdded {
            room_id: room_id.to_string(),
            event: target.clone(),
            key: key.to_string(),
        });
    }

    fn add_redaction(&self, room_id: &str, target: &Event) {
        self.emit(UiUpdate::EventRedacted {
            room_id: room_id.to_string(),
            event: target.clone(),
        });
    }

    fn set_typing(&self, room_id: &str, users: &[String]) {
        self.emit(UiUpdate::Typing {
            room_id: room_id.to_string(),
            users: users.to_vec(),
        });
    }

    fn alert(&self, room: &Room, event: &Event, verdict: PushVerdict) {
        self.emit(UiUpdate::Alert {
            room_id: room.id.clone(),
            event: event.clone(),
            verdict,
        });
    }

    fn update_tags(&self, room: &Room) {
        self.emit(UiUpdate::TagsUpdated(room.clone()));
    }

    fn set_rooms(&self, rooms: &[Room]) {
        self.emit(UiUpdate::RoomsReplaced(rooms.to_vec()));
    }

    fn preferences_changed(&self, preferences: &Preferences) {
        self.emit(UiUpdate::PreferencesChanged(preferences.clone()));
    }

    fn on_logout(&self) {
        self.emit(UiUpdate::LoggedOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roomkeeper::events::EVENT_MESSAGE;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_panic() {
        let ui = BroadcastUi::new();
        ui.remove_room("!room");
        ui.on_logout();
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates_in_order() {
        let ui = BroadcastUi::new();
        let mut first = ui.subscribe();
        let mut second = ui.subscribe();

        let room = Room::new("!room");
        let event = Event::new("$1", "!room", "@bob", EVENT_MESSAGE, 1, json!({"body": "hi"}));
        ui.append_to_timeline(&room, &event);
        ui.set_typing("!room", &["@bob".to_string()]);

        for receiver in [&mut first, &mut second] {
            match receiver.recv().await.unwrap() {
                UiUpdate::TimelineAppended { room_id, event } => {
                    assert_eq!(room_id, "!room");
                    assert_eq!(event.id, "$1");
                }
                other => panic!("unexpected update {other:?}"),
            }
            match receiver.recv().await.unwrap() {
                UiUpdate::Typing { users, .. } => assert_eq!(users, vec!["@bob".to_string()]),
                other => panic!("unexpected update {other:?}"),
            }
        }
    }
}
