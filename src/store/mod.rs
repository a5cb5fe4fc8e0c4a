//! Counter storage.
//!
//! The limiter keeps all per-client state behind [`CounterStore`]. Exactly
//! one implementation is picked at startup: [`RedisCounterStore`] when a
//! shared backend is configured, [`LocalCounterStore`] otherwise.

mod memory;
mod redis;

pub use self::memory::LocalCounterStore;
pub use self::redis::RedisCounterStore;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::ratelimit::{Clock, ClientKey, CounterRecord};

/// Atomic counter operations over [`CounterRecord`]s.
///
/// Every method must be atomic with respect to concurrent callers on the
/// same key. Window rollover and lockout happen inside the backend so that
/// no caller ever writes back a record it read earlier. Backend failures
/// come back as
/// [`TurnstileError::StoreUnavailable`](crate::error::TurnstileError::StoreUnavailable)
/// and are never retried here.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Load the live record for a key, if any.
    async fn get(&self, key: &ClientKey) -> Result<Option<CounterRecord>>;

    /// Replace the record and (re)start its expiry.
    async fn set_with_expiry(
        &self,
        key: &ClientKey,
        record: &CounterRecord,
        ttl_seconds: u64,
    ) -> Result<()>;

    /// Count one request at `now` and return the record afterwards.
    ///
    /// In one atomic step: a record under an active lockout is returned
    /// unchanged; an absent record, or one whose window or lockout has run
    /// out, is replaced by a window opening at `now` with `count = 1` and
    /// expiring after `ttl_seconds`; otherwise `count` goes up by one.
    async fn increment(
        &self,
        key: &ClientKey,
        now: i64,
        window_ms: i64,
        ttl_seconds: u64,
    ) -> Result<CounterRecord>;

    /// Lock the bucket out until `until`, keeping it for at least
    /// `ttl_seconds`.
    ///
    /// Applies only while the stored window still opens at
    /// `window_start_at` and no lockout is set. Returns the lockout end now
    /// in force, or `None` when the window has already moved on.
    async fn lock_out(
        &self,
        key: &ClientKey,
        window_start_at: i64,
        until: i64,
        ttl_seconds: u64,
    ) -> Result<Option<i64>>;
}

/// Pick the store for this process.
///
/// The local store gets its sweeper started here, so this must run inside
/// a tokio runtime.
pub fn from_config(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    match config.redis_url {
        Some(ref url) => {
            let store = RedisCounterStore::new(url, &config.key_prefix, config.timeout)?;
            info!(timeout_ms = config.timeout.as_millis() as u64, "Using Redis counter store");
            Ok(Arc::new(store))
        }
        None => {
            let store = Arc::new(LocalCounterStore::with_clock(clock));
            store.spawn_sweeper(config.sweep_interval);
            info!(
                sweep_interval_secs = config.sweep_interval.as_secs(),
                "No shared backend configured, using local counter store"
            );
            Ok(store)
        }
    }
}
