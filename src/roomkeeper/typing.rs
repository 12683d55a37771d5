use std::sync::atomic::{AtomicI64, Ordering};

/// Minimum gap between two "started typing" notifications.
pub const TYPING_DEBOUNCE_SECS: i64 = 15;

/// How long the server shows us as typing after a notification.
pub const TYPING_TIMEOUT_MS: u64 = 20_000;

/// Rate limits outgoing typing notifications by wall-clock seconds.
#[derive(Debug, Default)]
pub struct TypingDebouncer {
    /// Unix time before which another "typing" is not sent. Zero when idle.
    quiet_until: AtomicI64,
}

impl TypingDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a notification should go out at `now` (unix seconds).
    /// "Stopped typing" is only sent after a "typing" and re-arms the
    /// debouncer.
    pub fn should_send(&self, typing: bool, now: i64) -> bool {
        if !typing {
            return self.reset();
        }

        let quiet_until = self.quiet_until.load(Ordering::SeqCst);
        if quiet_until > now {
            return false;
        }
        self.quiet_until
            .store(now + TYPING_DEBOUNCE_SECS, Ordering::SeqCst);
        true
    }

    /// Forget any "typing" sent so far. Returns true if one was.
    pub fn reset(&self) -> bool {
        self.quiet_until.swap(0, Ordering::SeqCst) != 0
    }
}
