//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::CounterState;
use super::decision::RateLimitDecision;
use super::key::{ClientKey, RateLimitScope};
use super::policy::{RateLimitConfig, RateLimitPolicy};
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// A decision and how it was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitCheck {
    pub decision: RateLimitDecision,
    /// The backend or the state machine failed and the request was let through.
    pub failed_open: bool,
}

impl LimitCheck {
    fn enforced(decision: RateLimitDecision) -> Self {
        Self {
            decision,
            failed_open: false,
        }
    }

    fn failed_open(decision: RateLimitDecision) -> Self {
        Self {
            decision,
            failed_open: true,
        }
    }
}

/// The rate limiter that turns policy and stored counters into decisions.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// All backend failures stop at [`check_limit`](Self::check_limit), which
/// fails open.
pub struct RateLimiter {
    policy: Arc<RateLimitPolicy>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter on the system clock.
    pub fn new(policy: Arc<RateLimitPolicy>, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(policy, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        policy: Arc<RateLimitPolicy>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            store,
            clock,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Check and count one request for `key` under `scope`'s limits.
    ///
    /// Never fails: a broken backend or an inconsistent record yields an
    /// allowed decision and a log line.
    pub async fn check_limit(&self, key: &ClientKey, scope: RateLimitScope) -> RateLimitDecision {
        self.check(key, scope).await.decision
    }

    /// Like [`check_limit`](Self::check_limit), also reporting whether the
    /// decision came from failing open.
    pub async fn check(&self, key: &ClientKey, scope: RateLimitScope) -> LimitCheck {
        let config = self.policy.get_config(scope);
        let now = self.clock.now_ms();

        if !config.enabled {
            trace!(key = %key, "Scope disabled, not counting");
            return LimitCheck::enforced(RateLimitDecision::unenforced(config, now));
        }

        match self.evaluate(key, config, now).await {
            Ok(decision) => LimitCheck::enforced(decision),
            Err(TurnstileError::StoreUnavailable(reason)) => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    reason = %reason,
                    "Counter store unavailable, failing open"
                );
                LimitCheck::failed_open(RateLimitDecision::unenforced(config, now))
            }
            Err(e) => {
                error!(
                    key = %key,
                    store = self.store.name(),
                    error = %e,
                    "Rate limit decision failed, failing open"
                );
                LimitCheck::failed_open(RateLimitDecision::unenforced(config, now))
            }
        }
    }

    /// The state machine proper. Backend errors propagate to the caller.
    ///
    /// Every mutation is a single atomic store call; nothing read here is
    /// ever written back.
    async fn evaluate(
        &self,
        key: &ClientKey,
        config: &RateLimitConfig,
        now: i64,
    ) -> Result<RateLimitDecision> {
        let window_ms = config.window_ms();

        if let Some(record) = self.store.get(key).await? {
            if let CounterState::Blocked { until } = record.state(now, window_ms) {
                trace!(key = %key, blocked_until = until, "Client is locked out");
                return Ok(RateLimitDecision::blocked(config, now, until));
            }
        }

        let record = self
            .store
            .increment(key, now, window_ms, config.ttl_seconds())
            .await?;

        match record.state(now, window_ms) {
            // Locked out by a concurrent request since the read above.
            CounterState::Blocked { until } => {
                return Ok(RateLimitDecision::blocked(config, now, until));
            }
            CounterState::Open | CounterState::WindowExpired => {}
        }

        if record.count <= config.max_requests {
            return Ok(RateLimitDecision::allowed(config, &record));
        }

        let until = now.checked_add(config.block_ms()).ok_or_else(|| {
            TurnstileError::Decision(format!("lockout end overflows for {}", key))
        })?;
        // A window that moved on underneath still rejects this request.
        let until = self
            .store
            .lock_out(key, record.window_start_at, until, config.block_seconds)
            .await?
            .unwrap_or(until);

        debug!(
            key = %key,
            count = record.count,
            limit = config.max_requests,
            block_seconds = config.block_seconds,
            "Rate limit exceeded, locking out client"
        );
        Ok(RateLimitDecision::blocked(config, now, until))
    }
}
