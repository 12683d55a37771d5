use super::SyncContext;
use crate::roomkeeper::events::{Event, EventKind, SourceFlags};

impl SyncContext {
    /// Route one delivered event to exactly one handler.
    pub(crate) async fn dispatch(&mut self, source: SourceFlags, event: Event) {
        match event.kind() {
            EventKind::Message
            | EventKind::Encrypted
            | EventKind::Sticker
            | EventKind::Reaction
            | EventKind::RoomName
            | EventKind::Topic
            | EventKind::CanonicalAlias
            | EventKind::RoomAliases => self.handle_message(source, event).await,
            EventKind::Redaction => self.handle_redaction(source, event).await,
            EventKind::Member => self.handle_membership(source, event).await,
            EventKind::Receipt => self.handle_read_receipt(source, event).await,
            EventKind::Typing => self.handle_typing(source, event).await,
            EventKind::DirectChats => self.handle_direct_chats(source, event).await,
            EventKind::PushRules => self.handle_push_rules(source, event).await,
            EventKind::Tag => self.handle_tags(source, event).await,
            EventKind::Preferences => self.handle_preferences(source, event).await,
            EventKind::Unknown(event_type) => {
                tracing::debug!(
                    target: "roomkeeper::event_processor::dispatch",
                    "No handler for event type {} ({}), dropping",
                    event_type,
                    event.id
                );
            }
        }
    }
}
