use chrono::Utc;
use serde_json::{Value, json};

use super::Roomkeeper;
use super::error::Result;
use super::event_processor::{EchoOutcome, WorkerCommand};
use super::events::{EVENT_MESSAGE, EVENT_REACTION, Event};
use super::local_echo::{create_local_echo, new_transaction_id};
use super::relations::replacement_content;
use super::typing::TYPING_TIMEOUT_MS;

impl Roomkeeper {
    /// Send a plain text message.
    pub async fn send_message(&self, room_id: &str, body: &str) -> Result<Event> {
        self.send_event(
            room_id,
            EVENT_MESSAGE,
            json!({"msgtype": "m.text", "body": body}),
        )
        .await
    }

    /// React to an event with `key`.
    pub async fn send_reaction(&self, room_id: &str, target_id: &str, key: &str) -> Result<Event> {
        self.send_event(
            room_id,
            EVENT_REACTION,
            json!({
                "m.relates_to": {
                    "rel_type": "m.annotation",
                    "event_id": target_id,
                    "key": key,
                }
            }),
        )
        .await
    }

    /// Show `content` as a local echo right away and send it in the
    /// background. Returns the echo; it is confirmed or marked failed later
    /// through the UI sink.
    pub async fn send_event(&self, room_id: &str, event_type: &str, content: Value) -> Result<Event> {
        self.stop_typing(room_id);

        let transaction_id = new_transaction_id();
        let echo = create_local_echo(
            room_id,
            &self.config.user_id,
            event_type,
            content.clone(),
            &transaction_id,
        );

        let registered = echo.clone();
        self.request(|reply| WorkerCommand::RegisterEcho {
            echo: registered,
            reply,
        })
        .await?;

        let transport = self.transport.clone();
        let commands = self.command_sender.clone();
        let room_id = room_id.to_string();
        let event_type = event_type.to_string();
        self.tasks.spawn("send_event", async move {
            match transport
                .send_event(&room_id, &event_type, &content, &transaction_id)
                .await
            {
                Ok(event_id) => tracing::debug!(
                    target: "roomkeeper::messages::send_event",
                    "Sent {} as {} in {}",
                    transaction_id,
                    event_id,
                    room_id
                ),
                Err(e) => {
                    tracing::warn!(
                        target: "roomkeeper::messages::send_event",
                        "Failed to send {} in {}: {}",
                        transaction_id,
                        room_id,
                        e
                    );
                    let _ = commands
                        .send(WorkerCommand::EchoFailed {
                            room_id,
                            transaction_id,
                        })
                        .await;
                }
            }
        });

        Ok(echo)
    }

    /// Replace the content of one of our own messages. If the target is
    /// still a local echo, the echo is rewritten and the edit goes out once
    /// the server has assigned an id.
    pub async fn edit_message(&self, room_id: &str, target_id: &str, new_content: Value) -> Result<()> {
        let outcome = self
            .request(|reply| WorkerCommand::EditPending {
                room_id: room_id.to_string(),
                target_id: target_id.to_string(),
                content: new_content.clone(),
                reply,
            })
            .await?;

        if outcome == EchoOutcome::RewrotePending {
            return Ok(());
        }

        self.stop_typing(room_id);
        let content = replacement_content(target_id, &new_content);
        let transaction_id = new_transaction_id();
        self.transport
            .send_event(room_id, EVENT_MESSAGE, &content, &transaction_id)
            .await?;
        Ok(())
    }

    /// Redact an event. Returns the id of the redaction event.
    pub async fn redact(&self, room_id: &str, event_id: &str, reason: Option<&str>) -> Result<String> {
        let transaction_id = new_transaction_id();
        Ok(self
            .transport
            .redact(room_id, event_id, reason, &transaction_id)
            .await?)
    }

    /// Tell the room we started or stopped typing. Repeated "typing" calls
    /// inside the debounce window are dropped.
    pub fn send_typing(&self, room_id: &str, typing: bool) {
        if self.typing.should_send(typing, Utc::now().timestamp()) {
            self.spawn_typing(room_id, typing);
        }
    }

    /// Sending anything ends our typing notification.
    fn stop_typing(&self, room_id: &str) {
        if self.typing.reset() {
            self.spawn_typing(room_id, false);
        }
    }

    fn spawn_typing(&self, room_id: &str, typing: bool) {
        let transport = self.transport.clone();
        let room_id = room_id.to_string();
        let timeout_ms = if typing { TYPING_TIMEOUT_MS } else { 0 };
        self.tasks.spawn("send_typing", async move {
            if let Err(e) = transport.set_typing(&room_id, typing, timeout_ms).await {
                tracing::debug!(
                    target: "roomkeeper::messages::send_typing",
                    "Failed to send typing notification to {}: {}",
                    room_id,
                    e
                );
            }
        });
    }

    /// Move our read marker to `event_id` locally and on the server.
    pub async fn mark_read(&self, room_id: &str, event_id: &str) -> Result<()> {
        self.request(|reply| WorkerCommand::MarkRead {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            reply,
        })
        .await?;

        let transport = self.transport.clone();
        let room_id = room_id.to_string();
        let event_id = event_id.to_string();
        self.tasks.spawn("mark_read", async move {
            if let Err(e) = transport.mark_read(&room_id, &event_id).await {
                tracing::debug!(
                    target: "roomkeeper::messages::mark_read",
                    "Failed to send read marker for {}: {}",
                    event_id,
                    e
                );
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use crate::roomkeeper::events::{OutgoingState, SourceFlags};
    use crate::roomkeeper::test_utils::*;
    use crate::roomkeeper::transport::SyncedEvent;
    use crate::roomkeeper::ui::UiUpdate;

    #[tokio::test]
    async fn test_send_message_shows_local_echo() {
        let mut test = create_test_client(MockTransport::default()).await;

        let echo = test.client.send_message(ROOM, "hello").await.unwrap();
        assert_eq!(echo.outgoing_state, OutgoingState::LocalEcho);
        assert_eq!(echo.transaction_id(), Some(echo.id.as_str()));

        test.client.tasks.drain().await;
        let sent = test.transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].3, echo.id);
        assert_eq!(sent[0].2["body"], "hello");

        let updates = drain_updates(&mut test.updates);
        assert!(updates.iter().any(|update| matches!(
            update,
            UiUpdate::TimelineAppended { event, .. } if event.id == echo.id
        )));
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_send_marks_echo_failed() {
        let transport = MockTransport::default();
        transport.fail_sends.store(true, Ordering::SeqCst);
        let mut test = create_test_client(transport).await;

        let echo = test.client.send_message(ROOM, "doomed").await.unwrap();
        test.client.tasks.drain().await;
        // The failure report is queued before this request
        test.client.rooms().await.unwrap();

        let stored = test.client.get_event(ROOM, &echo.id).await.unwrap();
        assert_eq!(stored.outgoing_state, OutgoingState::Failed);
        assert!(drain_updates(&mut test.updates).iter().any(|update| matches!(
            update,
            UiUpdate::LocalEchoFailed { transaction_id, .. } if *transaction_id == echo.id
        )));
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_of_confirmed_message_is_sent_immediately() {
        let test = create_test_client(MockTransport::default()).await;

        test.client
            .edit_message(ROOM, "$confirmed", json!({"msgtype": "m.text", "body": "fixed"}))
            .await
            .unwrap();

        let sent = test.transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2["m.relates_to"]["event_id"], "$confirmed");
        assert_eq!(sent[0].2["m.new_content"]["body"], "fixed");
        assert_eq!(sent[0].2["body"], "* fixed");
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_of_pending_echo_waits_for_server_id() {
        // Nothing is ever synced back, so the echo stays pending
        let test = create_test_client(MockTransport::default()).await;

        let echo = test.client.send_message(ROOM, "draft").await.unwrap();
        test.client.tasks.drain().await;
        test.transport.sent.lock().unwrap().clear();

        test.client
            .edit_message(ROOM, &echo.id, json!({"msgtype": "m.text", "body": "final"}))
            .await
            .unwrap();
        assert!(test.transport.sent.lock().unwrap().is_empty());

        let stored = test.client.get_event(ROOM, &echo.id).await.unwrap();
        assert_eq!(stored.content["body"], "final");
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_redact_goes_straight_to_server() {
        let test = create_test_client(MockTransport::default()).await;
        let redaction_id = test
            .client
            .redact(ROOM, "$target", Some("spam"))
            .await
            .unwrap();
        assert_eq!(redaction_id, "$redaction");
        assert_eq!(
            *test.transport.redactions.lock().unwrap(),
            vec![(ROOM.to_string(), "$target".to_string(), Some("spam".to_string()))]
        );
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_typing_is_debounced() {
        let test = create_test_client(MockTransport::default()).await;

        // Nothing to stop yet
        test.client.send_typing(ROOM, false);
        test.client.send_typing(ROOM, true);
        test.client.send_typing(ROOM, true);
        test.client.send_typing(ROOM, false);
        test.client.send_typing(ROOM, false);
        test.client.tasks.drain().await;

        let mut typing = test.transport.typing.lock().unwrap().clone();
        typing.sort();
        assert_eq!(
            typing,
            vec![(ROOM.to_string(), false), (ROOM.to_string(), true)]
        );
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sending_a_message_stops_typing() {
        let test = create_test_client(MockTransport::default()).await;

        test.client.send_typing(ROOM, true);
        test.client.tasks.drain().await;
        test.client.send_message(ROOM, "done typing").await.unwrap();
        test.client.tasks.drain().await;

        assert_eq!(
            *test.transport.typing.lock().unwrap(),
            vec![(ROOM.to_string(), true), (ROOM.to_string(), false)]
        );
        // The window is re-armed, so typing again goes out at once
        test.client.send_typing(ROOM, true);
        test.client.tasks.drain().await;
        assert_eq!(test.transport.typing.lock().unwrap().len(), 3);

        // Without a pending "typing" nothing extra is sent
        test.client.send_typing(ROOM, false);
        test.client.tasks.drain().await;
        test.client.send_message(ROOM, "again").await.unwrap();
        test.client.tasks.drain().await;
        assert_eq!(test.transport.typing.lock().unwrap().len(), 4);
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_read_updates_room_and_server() {
        let test = create_test_client(MockTransport::default()).await;
        test.client.join_room(ROOM).await.unwrap();

        test.client.mark_read(ROOM, "$latest").await.unwrap();
        test.client.tasks.drain().await;

        let rooms = test.client.rooms().await.unwrap();
        assert_eq!(rooms[0].last_read_event.as_deref(), Some("$latest"));
        assert_eq!(
            *test.transport.read_markers.lock().unwrap(),
            vec![(ROOM.to_string(), "$latest".to_string())]
        );
        test.client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_synced_echo_is_confirmed_in_place() {
        let test = create_test_client(MockTransport::default()).await;
        let echo = test.client.send_message(ROOM, "hi").await.unwrap();

        let mut remote = message("$server", ME, "hi");
        remote.unsigned.transaction_id = Some(echo.id.clone());
        test.transport
            .syncs
            .lock()
            .unwrap()
            .push_back(Ok(crate::roomkeeper::transport::SyncBatch {
                next_batch: "s1".to_string(),
                events: vec![SyncedEvent::new(SourceFlags::TIMELINE, remote)],
                prev_batches: Default::default(),
            }));

        // Any command wakes the worker, which then polls the new batch
        let confirmed = loop {
            test.client.rooms().await.unwrap();
            if let Ok(event) = test.client.history.get(ROOM, "$server").await {
                break event;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(confirmed.outgoing_state, OutgoingState::Confirmed);
        assert!(test.client.history.get(ROOM, &echo.id).await.is_err());
        test.client.stop().await.unwrap();
    }
}
