use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use super::{SyncContext, WorkerExit};
use crate::roomkeeper::events::{Event, OutgoingState};
use crate::roomkeeper::history::HistoryError;
use crate::roomkeeper::relations::classify;
use crate::roomkeeper::rooms::Room;
use crate::roomkeeper::transport::MessagesPage;

/// Result of asking the worker to apply a local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EchoOutcome {
    /// The target was still a pending echo; its content was rewritten and
    /// the edit will be sent once the echo is confirmed.
    RewrotePending,
    /// The target is a confirmed event; send the edit now.
    SendToServer,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HistoryPage {
    pub events: Vec<Event>,
    pub prev_batch: Option<String>,
}

/// Requests from the public API, served by the sync worker between batches.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    RegisterEcho {
        echo: Event,
        reply: oneshot::Sender<()>,
    },
    EditPending {
        room_id: String,
        target_id: String,
        content: Value,
        reply: oneshot::Sender<EchoOutcome>,
    },
    EchoFailed {
        room_id: String,
        transaction_id: String,
    },
    LoadHistory {
        room_id: String,
        limit: usize,
        reply: oneshot::Sender<Result<HistoryPage, HistoryError>>,
    },
    ApplyBackfill {
        room_id: String,
        page: MessagesPage,
        reply: oneshot::Sender<Vec<Event>>,
    },
    ApplyMembers {
        room_id: String,
        members: Vec<Event>,
        reply: oneshot::Sender<()>,
    },
    MarkRead {
        room_id: String,
        event_id: String,
        reply: oneshot::Sender<()>,
    },
    MarkJoined {
        room_id: String,
        reply: oneshot::Sender<()>,
    },
    MarkLeft {
        room_id: String,
        reply: oneshot::Sender<()>,
    },
    Rooms {
        reply: oneshot::Sender<Vec<Room>>,
    },
    Logout {
        reply: oneshot::Sender<()>,
    },
}

impl SyncContext {
    /// Serve one command. Returns an exit reason if the worker must stop.
    pub(crate) async fn handle_command(&mut self, command: WorkerCommand) -> Option<WorkerExit> {
        match command {
            WorkerCommand::RegisterEcho { echo, reply } => {
                self.register_echo(echo).await;
                let _ = reply.send(());
            }
            WorkerCommand::EditPending {
                room_id,
                target_id,
                content,
                reply,
            } => {
                let outcome = self.edit_pending(&room_id, &target_id, content).await;
                let _ = reply.send(outcome);
            }
            WorkerCommand::EchoFailed {
                room_id,
                transaction_id,
            } => self.echo_failed(&room_id, &transaction_id).await,
            WorkerCommand::LoadHistory {
                room_id,
                limit,
                reply,
            } => {
                let room = self.rooms.get_or_create(&room_id);
                room.load();
                let prev_batch = room.prev_batch.clone();
                let result = self
                    .history
                    .load(&room_id, limit)
                    .await
                    .map(|events| HistoryPage { events, prev_batch });
                let _ = reply.send(result);
            }
            WorkerCommand::ApplyBackfill {
                room_id,
                page,
                reply,
            } => {
                let stored = self.apply_backfill(&room_id, page).await;
                let _ = reply.send(stored);
            }
            WorkerCommand::ApplyMembers {
                room_id,
                members,
                reply,
            } => {
                let room = self.rooms.get_or_create(&room_id);
                for member in &members {
                    room.update_state(member);
                }
                room.members_fetched = true;
                self.touch(&room_id);
                self.flush_dirty_rooms().await;
                let _ = reply.send(());
            }
            WorkerCommand::MarkRead {
                room_id,
                event_id,
                reply,
            } => {
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    room.mark_read(&event_id);
                    self.touch(&room_id);
                }
                let _ = reply.send(());
            }
            WorkerCommand::MarkJoined { room_id, reply } => {
                self.rooms.get_or_create(&room_id).mark_joined();
                self.touch(&room_id);
                self.flush_dirty_rooms().await;
                let _ = reply.send(());
            }
            WorkerCommand::MarkLeft { room_id, reply } => {
                self.rooms.get_or_create(&room_id).mark_left();
                self.history.rewind(&room_id).await;
                self.touch(&room_id);
                self.flush_dirty_rooms().await;
                let _ = reply.send(());
            }
            WorkerCommand::Rooms { reply } => {
                let _ = reply.send(self.rooms.visible());
            }
            WorkerCommand::Logout { reply } => {
                self.logout().await;
                let _ = reply.send(());
                return Some(WorkerExit::LoggedOut);
            }
        }
        None
    }

    async fn register_echo(&mut self, echo: Event) {
        let room_id = echo.room_id.clone();
        let Some(transaction_id) = echo.transaction_id().map(str::to_string) else {
            tracing::warn!(
                target: "roomkeeper::event_processor::register_echo",
                "Local echo {} has no transaction id",
                echo.id
            );
            return;
        };

        self.echoes.track(&room_id, &transaction_id);
        if let Some(stored) = self.store_event(&room_id, echo).await {
            let room = self.rooms.get_or_create(&room_id);
            self.ui.append_to_timeline(room, &stored);
        }
    }

    async fn edit_pending(&mut self, room_id: &str, target_id: &str, content: Value) -> EchoOutcome {
        let Some(pending) = self.echoes.find_edit_target(room_id, target_id) else {
            return EchoOutcome::SendToServer;
        };
        pending.deferred_edit = Some(content.clone());

        let result = self
            .history
            .update(room_id, target_id, &mut |echo: &mut Event| {
                echo.content = content.clone();
            })
            .await;
        match result {
            Ok(updated) => self.ui.add_edit(room_id, &updated),
            Err(e) => tracing::warn!(
                target: "roomkeeper::event_processor::edit_pending",
                "Failed to rewrite pending echo {}: {}",
                target_id,
                e
            ),
        }
        EchoOutcome::RewrotePending
    }

    async fn echo_failed(&mut self, room_id: &str, transaction_id: &str) {
        let Some(pending) = self.echoes.take(room_id, transaction_id) else {
            // Already confirmed by sync
            return;
        };

        if let Err(e) = self
            .history
            .update(room_id, &pending.local_id, &mut |echo: &mut Event| {
                echo.outgoing_state = OutgoingState::Failed;
            })
            .await
        {
            tracing::warn!(
                target: "roomkeeper::event_processor::echo_failed",
                "Failed to mark echo {} as failed: {}",
                transaction_id,
                e
            );
        }
        self.ui.local_echo_failed(room_id, transaction_id);
    }

    /// Store a page of older history fetched from the server. Relations
    /// whose targets are in the same page are folded in before storing.
    async fn apply_backfill(&mut self, room_id: &str, page: MessagesPage) -> Vec<Event> {
        let room = self.rooms.get_or_create(room_id);
        for state in &page.state {
            room.update_state(state);
        }
        room.prev_batch = page.end;
        self.touch(room_id);
        self.flush_dirty_rooms().await;

        let mut primaries: Vec<Event> = Vec::with_capacity(page.chunk.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut folded = Vec::new();
        let mut unresolved = Vec::new();

        // The server returns the page newest first
        for event in page.chunk.into_iter().rev() {
            let relation = classify(&event);
            let Some(target_id) = relation.target_id().map(str::to_string) else {
                positions.insert(event.id.clone(), primaries.len());
                primaries.push(event);
                continue;
            };
            if self.relation_seen(room_id, &event.id).await {
                continue;
            }
            match positions.get(&target_id) {
                Some(&index) => {
                    relation.apply(&mut primaries[index], &event);
                    folded.push(event.id);
                }
                None => unresolved.push((relation, event)),
            }
        }

        let stored = match self.history.prepend(room_id, primaries.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(
                    target: "roomkeeper::event_processor::apply_backfill",
                    "Failed to store backfilled events for {}: {}",
                    room_id,
                    e
                );
                primaries
            }
        };

        for event_id in folded {
            self.remember_relation(room_id, &event_id).await;
        }
        for (relation, event) in unresolved {
            self.apply_relation(room_id, relation, event).await;
        }

        stored
    }
}
