use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::Event;
use super::rooms::Room;

/// Outcome of evaluating the user's push rules against an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushVerdict {
    pub notify: bool,
    /// Whether any rule said something about notifying at all.
    pub notify_specified: bool,
    pub highlight: bool,
}

impl PushVerdict {
    /// An unspecified verdict counts as "notify".
    pub fn should_notify(&self) -> bool {
        self.notify || !self.notify_specified
    }
}

/// Push rule engine. The scoring itself lives outside this crate.
pub trait PushRuleEvaluator: Send + Sync {
    fn evaluate(&self, room: &Room, event: &Event) -> PushVerdict;

    /// Called with the content of a new `m.push_rules` account data event.
    fn replace_rules(&self, _content: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// What to do with a freshly stored primary event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Initial sync: remember when the room was last active, nothing else.
    RecordOnly,
    /// Unloaded room and the rules say don't notify: bump the unread state quietly.
    Unread { highlight: bool },
    /// Unloaded room and the rules say notify: surface the room and alert.
    Materialize { verdict: PushVerdict },
    /// Loaded room: append to the visible timeline, alert if the rules say so.
    Timeline { verdict: PushVerdict },
}

/// Tracks the sync phase and turns (phase, room state, verdict) into a
/// [`Delivery`].
#[derive(Debug, Clone, Default)]
pub struct NotificationGate {
    initial_sync_done: bool,
}

impl NotificationGate {
    pub fn new(initial_sync_done: bool) -> Self {
        Self { initial_sync_done }
    }

    pub fn is_live(&self) -> bool {
        self.initial_sync_done
    }

    /// Flip to the live phase. Returns true only on the first call.
    pub fn finish_initial_sync(&mut self) -> bool {
        let transitioned = !self.initial_sync_done;
        self.initial_sync_done = true;
        transitioned
    }

    pub fn decide(&self, room: &Room, event: &Event, rules: &dyn PushRuleEvaluator) -> Delivery {
        if !self.initial_sync_done {
            return Delivery::RecordOnly;
        }

        let verdict = rules.evaluate(room, event);
        if room.loaded {
            return Delivery::Timeline { verdict };
        }

        if verdict.should_notify() {
            Delivery::Materialize { verdict }
        } else {
            Delivery::Unread {
                highlight: verdict.highlight,
            }
        }
    }
}
