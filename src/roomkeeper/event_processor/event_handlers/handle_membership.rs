use crate::roomkeeper::event_processor::SyncContext;
use crate::roomkeeper::events::{Event, SourceFlags};
use crate::roomkeeper::rooms::Membership;

impl SyncContext {
    pub(crate) async fn handle_membership(&mut self, source: SourceFlags, event: Event) {
        let room_id = event.room_id.clone();
        let is_leave = source.contains(SourceFlags::LEAVE);
        let is_timeline = source.contains(SourceFlags::TIMELINE);

        self.rooms.get_or_create(&room_id).update_state(&event);
        self.touch(&room_id);

        if is_leave {
            self.leave_locally(&room_id).await;
        }

        let is_live = self.gate.is_live();
        if !is_live && is_leave && !is_timeline {
            return;
        }

        if event.state_key.as_deref() == Some(self.user_id.as_str()) {
            self.process_own_membership_change(&event).await;
        } else if !is_timeline && (!is_live || is_leave) {
            // Other users' state outside the timeline is recorded above and
            // needs nothing else.
            return;
        }

        self.handle_message(source, event).await;
    }

    async fn process_own_membership_change(&mut self, event: &Event) {
        let room_id = event.room_id.as_str();
        let Some(membership) = event.membership() else {
            return;
        };
        let prev_membership = event.prev_membership().unwrap_or("leave");

        tracing::debug!(
            target: "roomkeeper::event_processor::process_own_membership_change",
            "Own membership change: {} -> {} in {}",
            prev_membership,
            membership,
            room_id
        );
        if membership == prev_membership {
            return;
        }

        let is_live = self.gate.is_live();
        match Membership::parse(membership) {
            Some(Membership::Join) => {
                let room = self.rooms.get_or_create(room_id);
                room.mark_joined();
                if is_live {
                    self.ui.materialize_room(room);
                }
            }
            Some(Membership::Invite) => {
                if is_live {
                    let room = self.rooms.get_or_create(room_id);
                    self.ui.materialize_room(room);
                }
            }
            Some(Membership::Leave) | Some(Membership::Ban) => {
                if is_live {
                    self.ui.remove_room(room_id);
                }
                self.leave_locally(room_id).await;
            }
            _ => return,
        }
        self.touch(room_id);
    }
}
