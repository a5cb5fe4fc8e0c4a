//! In-process counter store.
//!
//! Correct within one process only. Several instances behind a load
//! balancer each keep their own counts.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::CounterStore;
use crate::error::Result;
use crate::ratelimit::{Clock, ClientKey, CounterRecord, CounterState, SystemClock};

#[derive(Debug, Clone, Copy)]
struct StoredEntry {
    record: CounterRecord,
    /// Epoch milliseconds after which the entry is gone
    expires_at: i64,
}

impl StoredEntry {
    fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

/// Counter store backed by a sharded concurrent map.
///
/// Each operation holds the shard lock for its key for its whole duration,
/// which makes `increment` and `lock_out` true read-modify-writes.
pub struct LocalCounterStore {
    entries: DashMap<ClientKey, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that reads expiry time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries held, live or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Local counter store dropped, stopping sweeper");
                    break;
                };
                let removed = store.sweep();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Swept expired counters");
                }
            }
        })
    }
}

impl Default for LocalCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(now: i64, ttl_seconds: u64) -> i64 {
    now.saturating_add((ttl_seconds as i64).saturating_mul(1000))
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &ClientKey) -> Result<Option<CounterRecord>> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.record))
    }

    async fn set_with_expiry(
        &self,
        key: &ClientKey,
        record: &CounterRecord,
        ttl_seconds: u64,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        self.entries.insert(
            key.clone(),
            StoredEntry {
                record: *record,
                expires_at: expiry(now, ttl_seconds),
            },
        );
        Ok(())
    }

    async fn increment(
        &self,
        key: &ClientKey,
        now: i64,
        window_ms: i64,
        ttl_seconds: u64,
    ) -> Result<CounterRecord> {
        let clock_now = self.clock.now_ms();
        let mut entry = self.entries.entry(key.clone()).or_insert(StoredEntry {
            record: CounterRecord::fresh(now),
            expires_at: i64::MIN,
        });

        let state = if entry.is_live(clock_now) {
            entry.record.state(now, window_ms)
        } else {
            CounterState::WindowExpired
        };

        match state {
            CounterState::Blocked { .. } => {}
            CounterState::Open => {
                entry.record.count = entry.record.count.saturating_add(1);
            }
            CounterState::WindowExpired => {
                *entry = StoredEntry {
                    record: CounterRecord {
                        count: 1,
                        window_start_at: now,
                        blocked_until_at: None,
                    },
                    expires_at: expiry(clock_now, ttl_seconds),
                };
            }
        }

        trace!(key = %key, count = entry.record.count, "Incremented local counter");
        Ok(entry.record)
    }

    async fn lock_out(
        &self,
        key: &ClientKey,
        window_start_at: i64,
        until: i64,
        ttl_seconds: u64,
    ) -> Result<Option<i64>> {
        let clock_now = self.clock.now_ms();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        if !entry.is_live(clock_now) {
            return Ok(None);
        }
        if let Some(existing) = entry.record.blocked_until_at {
            return Ok(Some(existing));
        }
        if entry.record.window_start_at != window_start_at {
            return Ok(None);
        }

        entry.record.blocked_until_at = Some(until);
        entry.expires_at = entry.expires_at.max(expiry(clock_now, ttl_seconds));
        Ok(Some(until))
    }
}
