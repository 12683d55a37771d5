use serde_json::Value;

use crate::roomkeeper::event_processor::SyncContext;
use crate::roomkeeper::events::{Event, SourceFlags};

impl SyncContext {
    pub(crate) async fn handle_read_receipt(&mut self, source: SourceFlags, event: Event) {
        if source.contains(SourceFlags::LEAVE) {
            return;
        }

        let Some(last_read) = latest_own_receipt(&event.content, &self.user_id) else {
            return;
        };

        let room_id = event.room_id.clone();
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        tracing::debug!(
            target: "roomkeeper::event_processor::handle_read_receipt",
            "Read marker in {} moved to {}",
            room_id,
            last_read
        );
        room.mark_read(&last_read);
        self.touch(&room_id);
    }
}

/// Find the event our own user read most recently in an `m.receipt` content
/// object of the form `{event_id: {"m.read": {user_id: {"ts": ...}}}}`.
fn latest_own_receipt(content: &Value, user_id: &str) -> Option<String> {
    content
        .as_object()?
        .iter()
        .filter_map(|(event_id, receipts)| {
            let ts = receipts
                .get("m.read")?
                .get(user_id)?
                .get("ts")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Some((ts, event_id))
        })
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, event_id)| event_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_latest_own_receipt_picks_largest_timestamp() {
        let content = json!({
            "$old": {"m.read": {"@me:hs": {"ts": 100}}},
            "$new": {"m.read": {"@me:hs": {"ts": 300}}},
            "$other": {"m.read": {"@them:hs": {"ts": 900}}},
        });
        assert_eq!(
            latest_own_receipt(&content, "@me:hs").as_deref(),
            Some("$new")
        );
    }

    #[test]
    fn test_latest_own_receipt_ignores_foreign_receipts() {
        let content = json!({"$a": {"m.read": {"@them:hs": {"ts": 1}}}});
        assert_eq!(latest_own_receipt(&content, "@me:hs"), None);
        assert_eq!(latest_own_receipt(&json!("garbage"), "@me:hs"), None);
    }
}
