//! Admission decisions.

use serde::Serialize;

use super::counter::CounterRecord;
use super::policy::RateLimitConfig;

/// The outcome of one rate limit check.
///
/// `retry_after_seconds` is computed once here and is the only value the
/// response layer renders, both in the header and in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds
    pub reset_at: i64,
    pub retry_after_seconds: u64,
}

impl RateLimitDecision {
    /// Allowed without counting. Used when a scope is disabled and when
    /// the limiter fails open.
    pub fn unenforced(config: &RateLimitConfig, now: i64) -> Self {
        Self {
            allowed: true,
            limit: config.max_requests,
            remaining: config.max_requests.saturating_sub(1),
            reset_at: now.saturating_add(config.window_ms()),
            retry_after_seconds: 0,
        }
    }

    /// Allowed and counted against `record`.
    pub fn allowed(config: &RateLimitConfig, record: &CounterRecord) -> Self {
        Self {
            allowed: true,
            limit: config.max_requests,
            remaining: config.max_requests.saturating_sub(record.count),
            reset_at: record.window_end(config.window_ms()),
            retry_after_seconds: 0,
        }
    }

    /// Rejected until `until`.
    pub fn blocked(config: &RateLimitConfig, now: i64, until: i64) -> Self {
        Self {
            allowed: false,
            limit: config.max_requests,
            remaining: 0,
            reset_at: until,
            retry_after_seconds: ceil_seconds(until.saturating_sub(now)),
        }
    }
}

/// Whole seconds needed to cover `millis`, rounding up.
fn ceil_seconds(millis: i64) -> u64 {
    if millis <= 0 {
        return 0;
    }
    (millis as u64).div_ceil(1000)
}
