use std::collections::HashSet;

use serde_json::Value;

use crate::roomkeeper::event_processor::SyncContext;
use crate::roomkeeper::events::{Event, SourceFlags};
use crate::roomkeeper::preferences::Preferences;

impl SyncContext {
    /// `m.direct` maps user ids to lists of room ids. Rooms not listed are
    /// no longer direct.
    pub(crate) async fn handle_direct_chats(&mut self, _source: SourceFlags, event: Event) {
        let direct: HashSet<&str> = event
            .content
            .as_object()
            .map(|users| {
                users
                    .values()
                    .filter_map(Value::as_array)
                    .flatten()
                    .filter_map(Value::as_str)
                    .collect()
            })
            .unwrap_or_default();

        let is_live = self.gate.is_live();
        let mut changed = Vec::new();
        for room in self.rooms.iter_mut() {
            let should_be_direct = direct.contains(room.id.as_str());
            if room.is_direct != should_be_direct {
                room.is_direct = should_be_direct;
                changed.push(room.id.clone());
            }
        }

        for room_id in changed {
            self.touch(&room_id);
            if is_live {
                if let Some(room) = self.rooms.get(&room_id) {
                    self.ui.update_tags(room);
                }
            }
        }
    }

    pub(crate) async fn handle_push_rules(&mut self, _source: SourceFlags, event: Event) {
        tracing::debug!(
            target: "roomkeeper::event_processor::handle_push_rules",
            "Received updated push rules"
        );
        if let Err(e) = self.push_rules.replace_rules(&event.content) {
            tracing::warn!(
                target: "roomkeeper::event_processor::handle_push_rules",
                "Failed to apply push rules: {}",
                e
            );
        }
    }

    pub(crate) async fn handle_tags(&mut self, _source: SourceFlags, event: Event) {
        let room_id = event.room_id.clone();
        let room = self.rooms.get_or_create(&room_id);
        room.set_tags_from_content(&event.content);
        tracing::debug!(
            target: "roomkeeper::event_processor::handle_tags",
            "Room {} now has {} tags",
            room_id,
            room.tags.len()
        );
        if self.gate.is_live() {
            self.ui.update_tags(room);
        }
        self.touch(&room_id);
    }

    pub(crate) async fn handle_preferences(&mut self, source: SourceFlags, event: Event) {
        if !source.contains(SourceFlags::ACCOUNT_DATA) {
            return;
        }
        let preferences: Preferences = match serde_json::from_value(event.content) {
            Ok(preferences) => preferences,
            Err(e) => {
                tracing::warn!(
                    target: "roomkeeper::event_processor::handle_preferences",
                    "Failed to parse updated preferences: {}",
                    e
                );
                return;
            }
        };
        tracing::debug!(
            target: "roomkeeper::event_processor::handle_preferences",
            "Updated preferences: {:?} -> {:?}",
            self.sync_state.preferences,
            preferences
        );
        self.sync_state.preferences = preferences;
        self.persist_sync_state().await;
        if self.gate.is_live() {
            self.ui.preferences_changed(&self.sync_state.preferences);
        }
    }
}
