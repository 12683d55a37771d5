use serde_json::Value;

use crate::roomkeeper::event_processor::SyncContext;
use crate::roomkeeper::events::{Event, SourceFlags};

impl SyncContext {
    pub(crate) async fn handle_typing(&mut self, _source: SourceFlags, event: Event) {
        let typing: Vec<String> = event
            .content
            .get("user_ids")
            .and_then(Value::as_array)
            .map(|users| {
                users
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let room = self.rooms.get_or_create(&event.room_id);
        room.typing = typing;

        if !self.gate.is_live() || self.sync_state.preferences.disable_typing_notifications {
            return;
        }
        self.ui.set_typing(&event.room_id, &room.typing);
    }
}
