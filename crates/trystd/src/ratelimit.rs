use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_WINDOW_ENTRIES: usize = 1000; // Prevent unbounded growth

/// The rate-limited action classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Chat messages relayed to a partner.
    Message,
    /// Skips (leaving a pair for a new match).
    Skip,
    /// Abuse reports against another user.
    Report,
}

impl ActionKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Message => "message",
            ActionKind::Skip => "skip",
            ActionKind::Report => "report",
        }
    }
}

/// Per-action cap: at most `limit` occurrences within `window`.
#[derive(Debug, Clone, Copy)]
pub struct ActionLimit {
    /// Maximum occurrences inside the window.
    pub limit: u32,
    /// Length of the sliding window.
    pub window: Duration,
}

/// Sliding window of action timestamps for one (user, action) pair.
///
/// Unlike a fixed window that resets at interval boundaries, this tracks
/// individual timestamps and only counts those within the trailing window,
/// so a burst straddling a boundary cannot double the effective allowance.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    entries: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Creates an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(8),
        }
    }

    /// Remove entries older than the window duration.
    fn expire_old_entries(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(*front) >= window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drops entries that have aged out of `window`; used by the periodic
    /// cleanup sweep so idle windows drain without traffic.
    pub fn expire(&mut self, window: Duration) {
        self.expire_old_entries(Instant::now(), window);
    }

    /// Number of entries currently inside the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are inside the window.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check the limit and record the action in a single pass.
    ///
    /// Returns `true` when the action is allowed (and recorded), `false`
    /// when the cap is already reached; rejected actions are not recorded.
    pub fn check_and_record(&mut self, limit: ActionLimit) -> bool {
        let now = Instant::now();
        self.expire_old_entries(now, limit.window);

        if self.entries.len() >= limit.limit as usize {
            return false;
        }

        self.entries.push_back(now);
        if self.entries.len() > MAX_WINDOW_ENTRIES {
            self.entries.pop_front();
        }
        true
    }
}
