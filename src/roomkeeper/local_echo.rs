//! Optimistic local sends
//!
//! A message the user sends is rendered immediately as a local echo whose id
//! is its client-generated transaction id. When the server later delivers the
//! authoritative event carrying the same transaction id, the stored echo is
//! re-keyed to the server id in place instead of producing a second timeline
//! entry.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;

use super::events::{Event, OutgoingState};

/// Generate a transaction id for an outgoing event.
pub fn new_transaction_id() -> String {
    format!("rk{}", uuid::Uuid::new_v4().simple())
}

/// Build the provisional event shown while a send is in flight.
pub fn create_local_echo(
    room_id: &str,
    sender: &str,
    event_type: &str,
    content: Value,
    transaction_id: &str,
) -> Event {
    let mut echo = Event::new(
        transaction_id,
        room_id,
        sender,
        event_type,
        Utc::now().timestamp_millis(),
        content,
    );
    echo.unsigned.transaction_id = Some(transaction_id.to_string());
    echo.outgoing_state = OutgoingState::LocalEcho;
    echo
}

/// Take over the server's identity for a stored echo. If the echo was
/// rewritten locally while pending, its newer content is kept.
pub fn confirm_echo(echo: &mut Event, confirmed: &Event, keep_local_content: bool) {
    echo.id = confirmed.id.clone();
    echo.timestamp = confirmed.timestamp;
    echo.sender = confirmed.sender.clone();
    if !keep_local_content {
        echo.content = confirmed.content.clone();
    }
    echo.unsigned.transaction_id = None;
    echo.outgoing_state = OutgoingState::Confirmed;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEcho {
    pub transaction_id: String,
    /// Id the echo is stored under until confirmation.
    pub local_id: String,
    /// Content of an edit made while the echo was still pending. It is sent
    /// as a real edit once the server id is known.
    pub deferred_edit: Option<Value>,
}

/// Pending echoes per room, oldest first.
#[derive(Debug, Default)]
pub struct LocalEchoReconciler {
    pending: HashMap<String, Vec<PendingEcho>>,
}

impl LocalEchoReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, room_id: &str, transaction_id: &str) {
        self.pending
            .entry(room_id.to_string())
            .or_default()
            .push(PendingEcho {
                transaction_id: transaction_id.to_string(),
                local_id: transaction_id.to_string(),
                deferred_edit: None,
            });
    }

    /// Remove and return the pending echo a confirmed event belongs to.
    pub fn take(&mut self, room_id: &str, transaction_id: &str) -> Option<PendingEcho> {
        let echoes = self.pending.get_mut(room_id)?;
        let index = echoes
            .iter()
            .position(|echo| echo.transaction_id == transaction_id)?;
        let echo = echoes.remove(index);
        if echoes.is_empty() {
            self.pending.remove(room_id);
        }
        Some(echo)
    }

    /// The pending echo an edit targets, matched by the echo's local id.
    pub fn find_edit_target(&mut self, room_id: &str, target_id: &str) -> Option<&mut PendingEcho> {
        self.pending
            .get_mut(room_id)?
            .iter_mut()
            .rev()
            .find(|echo| echo.local_id == target_id)
    }

    pub fn most_recent(&self, room_id: &str) -> Option<&PendingEcho> {
        self.pending.get(room_id).and_then(|echoes| echoes.last())
    }

    pub fn pending_count(&self, room_id: &str) -> usize {
        self.pending.get(room_id).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roomkeeper::events::EVENT_MESSAGE;
    use serde_json::json;

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = new_transaction_id();
        let b = new_transaction_id();
        assert_ne!(a, b);
        assert!(a.starts_with("rk"));
    }

    #[test]
    fn test_create_local_echo() {
        let echo = create_local_echo(
            "!room",
            "@me",
            EVENT_MESSAGE,
            json!({"body": "hi"}),
            "txn1",
        );
        assert_eq!(echo.id, "txn1");
        assert_eq!(echo.transaction_id(), Some("txn1"));
        assert_eq!(echo.outgoing_state, OutgoingState::LocalEcho);
        assert!(echo.timestamp > 0);
    }

    #[test]
    fn test_confirm_echo_takes_server_identity() {
        let mut echo = create_local_echo("!room", "@me", EVENT_MESSAGE, json!({"body": "hi"}), "txn1");
        let mut server = Event::new("$server", "!room", "@me", EVENT_MESSAGE, 42, json!({"body": "hi!"}));
        server.unsigned.transaction_id = Some("txn1".to_string());

        confirm_echo(&mut echo, &server, false);
        assert_eq!(echo.id, "$server");
        assert_eq!(echo.timestamp, 42);
        assert_eq!(echo.body(), Some("hi!"));
        assert_eq!(echo.outgoing_state, OutgoingState::Confirmed);
        assert_eq!(echo.transaction_id(), None);

        let mut rewritten =
            create_local_echo("!room", "@me", EVENT_MESSAGE, json!({"body": "edited"}), "txn1");
        confirm_echo(&mut rewritten, &server, true);
        assert_eq!(rewritten.body(), Some("edited"));
    }

    #[test]
    fn test_track_and_take() {
        let mut reconciler = LocalEchoReconciler::new();
        reconciler.track("!room", "t1");
        reconciler.track("!room", "t2");
        reconciler.track("!other", "t3");
        assert_eq!(reconciler.pending_count("!room"), 2);
        assert_eq!(reconciler.most_recent("!room").unwrap().transaction_id, "t2");

        let taken = reconciler.take("!room", "t1").unwrap();
        assert_eq!(taken.local_id, "t1");
        assert_eq!(reconciler.pending_count("!room"), 1);

        // Wrong room never matches
        assert!(reconciler.take("!room", "t3").is_none());
        assert!(reconciler.take("!other", "t3").is_some());
        assert_eq!(reconciler.pending_count("!other"), 0);
    }

    #[test]
    fn test_find_edit_target() {
        let mut reconciler = LocalEchoReconciler::new();
        reconciler.track("!room", "t1");
        reconciler.track("!room", "t2");

        let target = reconciler.find_edit_target("!room", "t2").unwrap();
        target.deferred_edit = Some(json!({"body": "fixed"}));
        assert_eq!(
            reconciler.most_recent("!room").unwrap().deferred_edit,
            Some(json!({"body": "fixed"}))
        );

        assert!(reconciler.find_edit_target("!room", "$confirmed").is_none());
        assert!(reconciler.find_edit_target("!elsewhere", "t1").is_none());

        reconciler.clear();
        assert_eq!(reconciler.pending_count("!room"), 0);
    }
}
