//! Fixed-window counter with an explicit block phase.

use std::time::Duration;
use tokio::time::Instant;

use super::backend::Decision;

/// Length of a counting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Per-key counting and blocking state.
///
/// A key is either open (counting inside the current window) or blocked
/// until `blocked_until`. Blocking supersedes counting: while blocked, the
/// window is frozen, and once the block has passed the whole state starts
/// over.
#[derive(Debug, Clone, Default)]
pub struct WindowState {
    /// Requests admitted in the current window
    count: u32,
    /// When the current window started, if one is active
    window_start: Option<Instant>,
    /// End of the block phase, if one was entered
    blocked_until: Option<Instant>,
}

impl WindowState {
    /// Create a fresh, unblocked, uncounted state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a request observed at `now` is admitted, updating the state.
    ///
    /// Block expiry and window expiry are both evaluated here, against the same
    /// `now`, before the counter is compared to `limit`.
    pub fn decide(&mut self, now: Instant, limit: u32, block: Duration) -> Decision {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Decision::denied(until.saturating_duration_since(now));
            }
            *self = WindowState::new();
        }

        if let Some(start) = self.window_start {
            if now.saturating_duration_since(start) >= WINDOW {
                self.count = 0;
                self.window_start = None;
            }
        }
        self.window_start.get_or_insert(now);

        if self.count >= limit {
            self.blocked_until = Some(block_end(now, block));
            return Decision::denied(block);
        }

        self.count += 1;
        Decision::allowed()
    }

    /// Requests admitted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the key is inside its block phase at `now`.
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    /// Whether the state carries no information any more at `now`.
    ///
    /// Stale entries can be dropped without changing any future decision.
    pub fn is_stale(&self, now: Instant) -> bool {
        match (self.blocked_until, self.window_start) {
            (Some(until), _) => now >= until,
            (None, Some(start)) => now.saturating_duration_since(start) >= WINDOW,
            (None, None) => true,
        }
    }
}

/// End of a block starting at `now`, saturating at the farthest instant the
/// clock can represent.
fn block_end(now: Instant, block: Duration) -> Instant {
    if let Some(until) = now.checked_add(block) {
        return until;
    }

    let mut until = now;
    let mut step = block;
    while step > Duration::ZERO {
        match until.checked_add(step) {
            Some(next) => until = next,
            None => step /= 2,
        }
    }
    until
}
