use crate::roomkeeper::event_processor::SyncContext;
use crate::roomkeeper::events::{EVENT_MESSAGE, Event, OutgoingState, SourceFlags};
use crate::roomkeeper::local_echo::{PendingEcho, confirm_echo, new_transaction_id};
use crate::roomkeeper::notifications::Delivery;
use crate::roomkeeper::relations::{Relation, classify, replacement_content};

impl SyncContext {
    pub(crate) async fn handle_message(&mut self, source: SourceFlags, event: Event) {
        let room_id = event.room_id.clone();

        if event.state_key.is_some() {
            self.rooms.get_or_create(&room_id).update_state(&event);
            self.touch(&room_id);
        }

        if source.contains(SourceFlags::LEAVE) {
            self.leave_locally(&room_id).await;
            return;
        }
        if source.contains(SourceFlags::STATE) {
            return;
        }

        match classify(&event) {
            Relation::Primary => self.handle_primary(event).await,
            relation => self.apply_relation(&room_id, relation, event).await,
        }
    }

    async fn handle_primary(&mut self, event: Event) {
        let room_id = event.room_id.clone();

        if let Some(transaction_id) = event.transaction_id().map(str::to_string) {
            if let Some(pending) = self.echoes.take(&room_id, &transaction_id) {
                if self.confirm_pending_echo(&room_id, pending, &event).await {
                    return;
                }
            }
        }

        let Some(stored) = self.store_event(&room_id, event).await else {
            return;
        };
        self.deliver(&room_id, &stored);
    }

    /// Re-key a stored echo to its confirmed server event, or drop the echo
    /// if the server copy is already stored. Returns false if the echo is
    /// gone from the store and the event should be appended normally.
    async fn confirm_pending_echo(&mut self, room_id: &str, pending: PendingEcho, event: &Event) -> bool {
        // A backfill may have stored the server copy already
        let confirmed = match self.history.get(room_id, &event.id).await {
            Ok(existing) => {
                self.drop_echo_row(room_id, &pending.local_id).await;
                existing
            }
            Err(_) => match self.rekey_echo(room_id, &pending, event).await {
                Some(confirmed) => confirmed,
                None => return false,
            },
        };

        let room = self.rooms.get_or_create(room_id);
        room.last_received_message = Some(confirmed.time());
        self.touch(room_id);

        self.ui
            .confirm_local_echo(room_id, &pending.transaction_id, &confirmed);

        if let Some(content) = pending.deferred_edit {
            self.send_deferred_edit(room_id, &confirmed.id, content);
        }
        true
    }

    async fn drop_echo_row(&self, room_id: &str, local_id: &str) {
        tracing::debug!(
            target: "roomkeeper::event_processor::drop_echo_row",
            "Server copy of echo {} already stored, dropping the echo",
            local_id
        );
        if let Err(e) = self.history.remove(room_id, local_id).await {
            tracing::warn!(
                target: "roomkeeper::event_processor::drop_echo_row",
                "Failed to remove echo {} from history: {}",
                local_id,
                e
            );
        }
    }

    /// Turn the stored echo into the server event. `None` if the echo is no
    /// longer stored.
    async fn rekey_echo(&self, room_id: &str, pending: &PendingEcho, event: &Event) -> Option<Event> {
        let keep_local_content = pending.deferred_edit.is_some();
        let result = self
            .history
            .update(room_id, &pending.local_id, &mut |echo: &mut Event| {
                confirm_echo(echo, event, keep_local_content)
            })
            .await;

        match result {
            Ok(confirmed) => Some(confirmed),
            Err(e) if e.is_not_found() => {
                tracing::debug!(
                    target: "roomkeeper::event_processor::rekey_echo",
                    "Echo {} not in history, storing {} as new",
                    pending.local_id,
                    event.id
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    target: "roomkeeper::event_processor::rekey_echo",
                    "Failed to confirm echo {} in history: {}",
                    pending.local_id,
                    e
                );
                let mut confirmed = event.clone();
                confirmed.outgoing_state = OutgoingState::Confirmed;
                Some(confirmed)
            }
        }
    }

    fn send_deferred_edit(&self, room_id: &str, target_id: &str, new_content: serde_json::Value) {
        let transport = self.transport.clone();
        let room_id = room_id.to_string();
        let content = replacement_content(target_id, &new_content);
        let transaction_id = new_transaction_id();

        self.tasks.spawn("deferred_edit", async move {
            if let Err(e) = transport
                .send_event(&room_id, EVENT_MESSAGE, &content, &transaction_id)
                .await
            {
                tracing::warn!(
                    target: "roomkeeper::event_processor::send_deferred_edit",
                    "Failed to send deferred edit in {}: {}",
                    room_id,
                    e
                );
            }
        });
    }

    /// Apply the notification decision for a freshly stored primary event.
    fn deliver(&mut self, room_id: &str, event: &Event) {
        let own_event = event.sender == self.user_id;
        let alerts_enabled = !own_event && !self.sync_state.preferences.disable_notifications;

        let room = self.rooms.get_or_create(room_id);
        room.last_received_message = Some(event.time());
        if room.has_left {
            // Left rooms have no view to update
            self.touch(room_id);
            return;
        }

        match self.gate.decide(room, event, self.push_rules.as_ref()) {
            Delivery::RecordOnly => {}
            Delivery::Unread { highlight } => {
                if !own_event {
                    room.add_unread(&event.id, false, highlight);
                }
            }
            Delivery::Materialize { verdict } => {
                if !own_event {
                    room.add_unread(&event.id, true, verdict.highlight);
                }
                self.ui.materialize_room(room);
                if alerts_enabled {
                    self.ui.alert(room, event, verdict);
                }
            }
            Delivery::Timeline { verdict } => {
                self.ui.append_to_timeline(room, event);
                if alerts_enabled && verdict.should_notify() {
                    self.ui.alert(room, event, verdict);
                }
            }
        }
        self.touch(room_id);
    }

    /// Flag a room as left and drop it from memory.
    pub(crate) async fn leave_locally(&mut self, room_id: &str) {
        let room = self.rooms.get_or_create(room_id);
        if room.has_left && !room.loaded {
            return;
        }
        room.mark_left();
        self.history.rewind(room_id).await;
        self.touch(room_id);
    }
}
