//! Redis-backed counter store.
//!
//! Records live in a hash per bucket:
//!
//! ```text
//! {prefix}:{scope}:{identifier} -> { count, window_start_at, [blocked_until_at] }
//! ```
//!
//! Every call is bounded by the configured timeout. Any failure drops the
//! cached connection so the next call reconnects; nothing is retried inline.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{RedisResult, Script};
use tracing::{debug, trace};

use super::CounterStore;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{ClientKey, CounterRecord};

const FIELD_COUNT: &str = "count";
const FIELD_WINDOW_START: &str = "window_start_at";
const FIELD_BLOCKED_UNTIL: &str = "blocked_until_at";

/// Count one request, rolling the window over when it or the lockout has
/// run out. Replies `{count, window_start_at, blocked_until_at | false}`;
/// `false` arrives as nil.
///
/// ARGV: now, window_ms, ttl_seconds
const INCREMENT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local fields = redis.call('HMGET', KEYS[1], 'count', 'window_start_at', 'blocked_until_at')
local count = tonumber(fields[1])
local start = tonumber(fields[2])
local blocked = tonumber(fields[3])

if blocked and now < blocked then
    return {count or 0, start or now, blocked}
end

if count == nil or start == nil or blocked or now >= start + tonumber(ARGV[2]) then
    redis.call('DEL', KEYS[1])
    redis.call('HSET', KEYS[1], 'count', 1, 'window_start_at', ARGV[1])
    redis.call('EXPIRE', KEYS[1], ARGV[3])
    return {1, now, false}
end

count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, start, false}
"#;

/// Set the lockout if the window is unchanged and none is set yet. Replies
/// with the lockout end in force, or nil when the window moved on.
///
/// ARGV: window_start_at, until, ttl_seconds
const LOCK_OUT_SCRIPT: &str = r#"
local fields = redis.call('HMGET', KEYS[1], 'window_start_at', 'blocked_until_at')
if fields[2] then
    return tonumber(fields[2])
end
if tonumber(fields[1]) ~= tonumber(ARGV[1]) then
    return false
end
redis.call('HSET', KEYS[1], 'blocked_until_at', ARGV[2])
if redis.call('TTL', KEYS[1]) < tonumber(ARGV[3]) then
    redis.call('EXPIRE', KEYS[1], ARGV[3])
end
return tonumber(ARGV[2])
"#;

/// Counter store shared by every instance talking to the same Redis.
pub struct RedisCounterStore {
    client: redis::Client,
    prefix: String,
    timeout: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
    increment_script: Script,
    lock_out_script: Script,
}

impl RedisCounterStore {
    /// Create a store. No connection is made until the first call.
    pub fn new(redis_url: &str, prefix: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| TurnstileError::Config(format!("invalid redis_url: {}", e)))?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
            timeout,
            connection: Mutex::new(None),
            increment_script: Script::new(INCREMENT_SCRIPT),
            lock_out_script: Script::new(LOCK_OUT_SCRIPT),
        })
    }

    fn storage_key(&self, key: &ClientKey) -> String {
        key.to_storage_key(&self.prefix)
    }

    async fn connection(&self) -> RedisResult<MultiplexedConnection> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Connected to Redis counter store");
        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    fn reset_connection(&self) {
        self.connection.lock().take();
    }

    /// Run one backend operation under the timeout.
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let attempt = async {
            let conn = self.connection().await?;
            f(conn).await
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.reset_connection();
                Err(TurnstileError::StoreUnavailable(format!("redis {} failed: {}", op, e)))
            }
            Err(_) => {
                self.reset_connection();
                Err(TurnstileError::StoreUnavailable(format!(
                    "redis {} timed out after {}ms",
                    op,
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

/// Turn an `HGETALL` reply into a record. An empty hash means no record.
fn decode_record(fields: &HashMap<String, String>) -> Result<Option<CounterRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let count = field(fields, FIELD_COUNT)?
        .filter(|count| *count >= 0)
        .ok_or_else(|| TurnstileError::Decision("stored counter has no valid count".to_string()))?;
    let window_start_at = field(fields, FIELD_WINDOW_START)?.ok_or_else(|| {
        TurnstileError::Decision("stored counter has no window start".to_string())
    })?;

    Ok(Some(CounterRecord {
        count: count as u64,
        window_start_at,
        blocked_until_at: field(fields, FIELD_BLOCKED_UNTIL)?,
    }))
}

/// An optional integer field. Present but unparseable is corrupt.
fn field(fields: &HashMap<String, String>, name: &str) -> Result<Option<i64>> {
    fields
        .get(name)
        .map(|raw| {
            raw.trim().parse::<i64>().map_err(|_| {
                TurnstileError::Decision(format!("stored counter field {} is not an integer: {:?}", name, raw))
            })
        })
        .transpose()
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &ClientKey) -> Result<Option<CounterRecord>> {
        let storage_key = self.storage_key(key);
        let fields: HashMap<String, String> = self
            .run("HGETALL", |mut conn| async move {
                redis::cmd("HGETALL").arg(&storage_key).query_async(&mut conn).await
            })
            .await?;

        decode_record(&fields)
    }

    async fn set_with_expiry(
        &self,
        key: &ClientKey,
        record: &CounterRecord,
        ttl_seconds: u64,
    ) -> Result<()> {
        let storage_key = self.storage_key(key);

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(&storage_key).ignore();
        pipe.cmd("HSET")
            .arg(&storage_key)
            .arg(FIELD_COUNT)
            .arg(record.count)
            .arg(FIELD_WINDOW_START)
            .arg(record.window_start_at);
        if let Some(until) = record.blocked_until_at {
            pipe.arg(FIELD_BLOCKED_UNTIL).arg(until);
        }
        pipe.ignore();
        pipe.cmd("EXPIRE").arg(&storage_key).arg(ttl_seconds).ignore();

        self.run("MULTI", |mut conn| async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await?;

        trace!(key = %key, count = record.count, ttl_seconds, "Stored counter in Redis");
        Ok(())
    }

    async fn increment(
        &self,
        key: &ClientKey,
        now: i64,
        window_ms: i64,
        ttl_seconds: u64,
    ) -> Result<CounterRecord> {
        let storage_key = self.storage_key(key);
        let script = &self.increment_script;

        let (count, window_start_at, blocked_until_at): (i64, i64, Option<i64>) = self
            .run("EVALSHA", |mut conn| async move {
                script
                    .key(&storage_key)
                    .arg(now)
                    .arg(window_ms)
                    .arg(ttl_seconds)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        trace!(key = %key, count, window_start_at, "Incremented Redis counter");
        let count = u64::try_from(count)
            .map_err(|_| TurnstileError::Decision(format!("stored counter went negative: {}", count)))?;

        Ok(CounterRecord {
            count,
            window_start_at,
            blocked_until_at,
        })
    }

    async fn lock_out(
        &self,
        key: &ClientKey,
        window_start_at: i64,
        until: i64,
        ttl_seconds: u64,
    ) -> Result<Option<i64>> {
        let storage_key = self.storage_key(key);
        let script = &self.lock_out_script;

        let in_force: Option<i64> = self
            .run("EVALSHA", |mut conn| async move {
                script
                    .key(&storage_key)
                    .arg(window_start_at)
                    .arg(until)
                    .arg(ttl_seconds)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        trace!(key = %key, blocked_until = ?in_force, "Locked out Redis counter");
        Ok(in_force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitScope;
    use std::sync::Arc;

    const WINDOW_MS: i64 = 60_000;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_decode_empty_hash_is_absent() {
        assert_eq!(decode_record(&HashMap::new()).unwrap(), None);
    }

    #[test]
    fn test_decode_open_record() {
        let record = decode_record(&fields(&[("count", "3"), ("window_start_at", "1000")]))
            .unwrap()
            .unwrap();
        assert_eq!(
            record,
            CounterRecord {
                count: 3,
                window_start_at: 1_000,
                blocked_until_at: None,
            }
        );
    }

    #[test]
    fn test_decode_blocked_record() {
        let record = decode_record(&fields(&[
            ("count", "6"),
            ("window_start_at", "1000"),
            ("blocked_until_at", "601000"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(record.blocked_until_at, Some(601_000));
    }

    #[test]
    fn test_decode_corrupt_record() {
        let cases: [&[(&str, &str)]; 5] = [
            &[("window_start_at", "1000")],
            &[("count", "-1"), ("window_start_at", "1000")],
            &[("count", "1")],
            &[("count", "many"), ("window_start_at", "1000")],
            &[("count", "1"), ("window_start_at", "1000"), ("blocked_until_at", "soon")],
        ];
        for case in cases {
            let result = decode_record(&fields(case));
            assert!(matches!(result, Err(TurnstileError::Decision(_))), "{:?}", case);
        }
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = RedisCounterStore::new("not a url", "turnstile", Duration::from_millis(50));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_store_unavailable() {
        // Nothing listens on port 1.
        let store = RedisCounterStore::new(
            "redis://127.0.0.1:1/",
            "turnstile",
            Duration::from_millis(200),
        )
        .unwrap();
        let key = ClientKey::new(RateLimitScope::Login, "203.0.113.7");

        let result = store.get(&key).await;
        assert!(matches!(result, Err(TurnstileError::StoreUnavailable(_))));

        let result = store.increment(&key, 0, WINDOW_MS, 60).await;
        assert!(matches!(result, Err(TurnstileError::StoreUnavailable(_))));

        let result = store.lock_out(&key, 0, 1_000, 60).await;
        assert!(matches!(result, Err(TurnstileError::StoreUnavailable(_))));

        let result = store.set_with_expiry(&key, &CounterRecord::fresh(0), 60).await;
        assert!(matches!(result, Err(TurnstileError::StoreUnavailable(_))));
    }

    #[test]
    fn test_storage_key_uses_prefix() {
        let store =
            RedisCounterStore::new("redis://127.0.0.1/", "gate", Duration::from_millis(50)).unwrap();
        let key = ClientKey::new(RateLimitScope::Login, "10.0.0.1");
        assert_eq!(store.storage_key(&key), "gate:login:10.0.0.1");
    }

    // The tests below need a live server and are skipped unless
    // TURNSTILE_TEST_REDIS_URL is set.

    fn live_store() -> Option<RedisCounterStore> {
        let url = std::env::var("TURNSTILE_TEST_REDIS_URL").ok()?;
        let prefix = format!("turnstile-test-{}", uuid::Uuid::new_v4());
        Some(RedisCounterStore::new(&url, &prefix, Duration::from_secs(2)).unwrap())
    }

    async fn ttl(store: &RedisCounterStore, key: &ClientKey) -> i64 {
        let mut conn = store.connection().await.unwrap();
        redis::cmd("TTL")
            .arg(store.storage_key(key))
            .query_async::<_, i64>(&mut conn)
            .await
            .unwrap()
    }

    async fn delete(store: &RedisCounterStore, key: &ClientKey) {
        let mut conn = store.connection().await.unwrap();
        redis::cmd("DEL")
            .arg(store.storage_key(key))
            .query_async::<_, ()>(&mut conn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_live_counter_lifecycle() {
        let Some(store) = live_store() else {
            return;
        };
        let key = ClientKey::new(RateLimitScope::Login, "203.0.113.7");

        assert_eq!(store.get(&key).await.unwrap(), None);

        let record = store.increment(&key, 1_000, WINDOW_MS, 60).await.unwrap();
        assert_eq!(record, CounterRecord { count: 1, window_start_at: 1_000, blocked_until_at: None });
        let ttl_after_create = ttl(&store, &key).await;
        assert!(ttl_after_create > 0 && ttl_after_create <= 60);

        let record = store.increment(&key, 2_000, WINDOW_MS, 60).await.unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.window_start_at, 1_000);
        assert_eq!(store.get(&key).await.unwrap(), Some(record));

        // Lockout is set once and extends the key's lifetime.
        assert_eq!(store.lock_out(&key, 1_000, 9_000, 600).await.unwrap(), Some(9_000));
        assert_eq!(store.lock_out(&key, 1_000, 12_000, 600).await.unwrap(), Some(9_000));
        assert!(ttl(&store, &key).await > 60);

        // Counting is frozen while locked out.
        let record = store.increment(&key, 3_000, WINDOW_MS, 60).await.unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.blocked_until_at, Some(9_000));

        // Lockout served: a fresh window.
        let record = store.increment(&key, 9_000, WINDOW_MS, 60).await.unwrap();
        assert_eq!(record, CounterRecord { count: 1, window_start_at: 9_000, blocked_until_at: None });
        assert_eq!(store.get(&key).await.unwrap(), Some(record));

        // A lockout for an old window is ignored.
        assert_eq!(store.lock_out(&key, 1_000, 20_000, 600).await.unwrap(), None);

        // Window expiry rolls over as well.
        let record = store.increment(&key, 9_000 + WINDOW_MS, WINDOW_MS, 60).await.unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.window_start_at, 9_000 + WINDOW_MS);

        let replacement = CounterRecord { count: 4, window_start_at: 50, blocked_until_at: Some(70) };
        store.set_with_expiry(&key, &replacement, 30).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(replacement));
        assert!(ttl(&store, &key).await <= 30);

        delete(&store, &key).await;
    }

    #[tokio::test]
    async fn test_live_corrupt_field_is_decision_error() {
        let Some(store) = live_store() else {
            return;
        };
        let key = ClientKey::new(RateLimitScope::Login, "198.51.100.9");
        {
            let mut conn = store.connection().await.unwrap();
            redis::cmd("HSET")
                .arg(store.storage_key(&key))
                .arg(FIELD_COUNT)
                .arg("lots")
                .arg(FIELD_WINDOW_START)
                .arg(1_000)
                .query_async::<_, ()>(&mut conn)
                .await
                .unwrap();
        }

        assert!(matches!(store.get(&key).await, Err(TurnstileError::Decision(_))));
        // The connection was kept.
        assert!(store.connection.lock().is_some());

        delete(&store, &key).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_concurrent_rollover_counts_every_request() {
        let Some(store) = live_store() else {
            return;
        };
        let store = Arc::new(store);
        let key = ClientKey::new(RateLimitScope::Login, "hot");

        store.increment(&key, 0, WINDOW_MS, 600).await.unwrap();
        store.lock_out(&key, 0, 1_000, 600).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.increment(&key, 61_000, WINDOW_MS, 600).await.unwrap().count
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=40).collect::<Vec<u64>>());

        delete(&store, &key).await;
    }
}
