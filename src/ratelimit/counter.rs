//! Counter record and its state machine.

use serde::{Deserialize, Serialize};

/// Per-bucket state held in a counter store.
///
/// `blocked_until_at` is only ever set on the request that pushed `count`
/// past the limit. While it lies in the future it overrides the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Requests seen in the current window
    pub count: u64,
    /// Epoch milliseconds at which the current window opened
    pub window_start_at: i64,
    /// Epoch milliseconds until which the bucket is locked out
    pub blocked_until_at: Option<i64>,
}

/// Where a bucket stands at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    /// Window active, requests are counted.
    Open,
    /// Locked out until the given epoch milliseconds.
    Blocked { until: i64 },
    /// The window or the lockout has run out; the next request starts over.
    WindowExpired,
}

impl CounterRecord {
    /// A record for a window opening at `now`.
    pub fn fresh(now: i64) -> Self {
        Self {
            count: 0,
            window_start_at: now,
            blocked_until_at: None,
        }
    }

    /// Classify the record at `now` for a window of `window_ms`.
    pub fn state(&self, now: i64, window_ms: i64) -> CounterState {
        if let Some(until) = self.blocked_until_at {
            if now < until {
                return CounterState::Blocked { until };
            }
            // Lockout served: the client gets a clean window.
            return CounterState::WindowExpired;
        }

        if now >= self.window_start_at.saturating_add(window_ms) {
            CounterState::WindowExpired
        } else {
            CounterState::Open
        }
    }

    /// End of the current window in epoch milliseconds.
    pub fn window_end(&self, window_ms: i64) -> i64 {
        self.window_start_at.saturating_add(window_ms)
    }
}
