//! Typed adapter over the shared key/value store.
//!
//! The rest of the gateway never speaks the store protocol directly: it
//! programs against [`StoreApi`], which exposes exactly the primitives the
//! event plane needs (streams, pub/sub, hashes, sets, lists, TTLs, and the
//! atomic rate-limit check). Two backends exist: [`RedisStore`] for
//! deployments and [`MemoryStore`] for tests and local development.
//!
//! Failure policy lives here, not in callers: every backend call carries a
//! per-call deadline, idempotent commands retry with bounded backoff, and a
//! circuit breaker sheds load while the link is down. Callers only ever see
//! [`StoreError::Unavailable`] and decide their own fallback.

mod breaker;
mod memory;
mod redis_store;

pub use breaker::CircuitBreaker;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store deadline exceeded")]
    Deadline,
    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Whether waiting and retrying the same command could succeed.
    pub fn transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Deadline)
    }
}

/// One entry read back from a topic stream. `seq` is the authoritative
/// sequence carried in the entry's own fields, not the store's entry id.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub entry_id: String,
    pub seq: u64,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Message delivered by a pattern subscription.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Outcome of the atomic sliding-window check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_after_secs: u64,
    pub limit: u32,
}

/// Narrow store surface consumed by the event plane.
///
/// All methods fail with [`StoreError::Unavailable`] when the underlying
/// link is down; callers own the fallback policy.
#[async_trait]
pub trait StoreApi: Send + Sync {
    // Streams (durable per-topic tail).
    async fn stream_append(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<String>;
    /// Range over the stream head-to-tail, bounded by `max` scanned entries,
    /// yielding entries whose `seq` field is at least `min_seq`, ascending.
    async fn stream_range_from(
        &self,
        key: &str,
        min_seq: u64,
        max: usize,
    ) -> StoreResult<Vec<StreamEntry>>;
    async fn stream_trim_approx(&self, key: &str, cap: usize) -> StoreResult<()>;
    async fn stream_len(&self, key: &str) -> StoreResult<usize>;

    // Pub/sub fan-out across replicas.
    async fn publish(&self, channel: &str, payload: Bytes) -> StoreResult<()>;
    /// Open a pattern subscription on a dedicated connection. Messages are
    /// forwarded into the returned channel; dropping the receiver tears the
    /// subscription down.
    async fn pattern_subscribe(&self, pattern: &str)
        -> StoreResult<mpsc::Receiver<PubSubMessage>>;

    // Counters and plain strings.
    async fn incr(&self, key: &str) -> StoreResult<u64>;
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    // Hashes.
    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>>;
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;
    async fn hash_del(&self, key: &str, field: &str) -> StoreResult<()>;
    async fn hash_keys(&self, key: &str) -> StoreResult<Vec<String>>;

    // Sets.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn set_rem(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn set_card(&self, key: &str) -> StoreResult<usize>;

    // Lists (per-subscriber bounded queues).
    /// Append and return the new length.
    async fn list_push(&self, key: &str, value: Bytes) -> StoreResult<usize>;
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>>;
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()>;
    async fn list_len(&self, key: &str) -> StoreResult<usize>;
    /// Remove every occurrence of an exact value; returns how many went.
    async fn list_rem(&self, key: &str, value: &Bytes) -> StoreResult<usize>;

    // Keyspace.
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn keys_by_pattern(&self, pattern: &str) -> StoreResult<Vec<String>>;
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomic sliding-window admission check. Window and scores come from
    /// the store's clock; the caller never supplies a timestamp.
    async fn rate_limit(&self, key: &str, window: Duration, limit: u32)
        -> StoreResult<RateDecision>;
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CEILING: Duration = Duration::from_secs(10);

/// Bounded retry for idempotent commands. Non-idempotent commands (stream
/// appends, queue pushes) never pass through here; their callers decide.
pub(crate) async fn with_retry<T, F, Fut>(op: &'static str, mut call: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut delay = RETRY_BASE;
    for attempt in 1..=RETRY_ATTEMPTS {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.transient() && attempt < RETRY_ATTEMPTS => {
                tracing::debug!(op, attempt, error = %err, "retrying store command");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CEILING);
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop returns on final attempt")
}

/// Glob match with `*` wildcards, the subset of store key patterns the
/// gateway uses (`rt:pub:*`, `rt:topic:*:meta`).
pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let (mut p_idx, mut v_idx) = (0usize, 0usize);
    let (mut star_idx, mut match_idx) = (None, 0usize);
    let pattern_bytes = pattern.as_bytes();
    let value_bytes = value.as_bytes();

    while v_idx < value_bytes.len() {
        if p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == b'*' {
            star_idx = Some(p_idx);
            match_idx = v_idx;
            p_idx += 1;
            continue;
        }

        if p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == value_bytes[v_idx] {
            p_idx += 1;
            v_idx += 1;
            continue;
        }

        if let Some(star) = star_idx {
            p_idx = star + 1;
            match_idx += 1;
            v_idx = match_idx;
            continue;
        }

        return false;
    }

    while p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == b'*' {
        p_idx += 1;
    }

    p_idx == pattern_bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn glob_matches_publish_channels() {
        assert!(glob_match("rt:pub:*", "rt:pub:t1:doc:123"));
        assert!(glob_match("rt:topic:*:meta", "rt:topic:t1:doc:123:meta"));
        assert!(!glob_match("rt:pub:*", "rt:stream:t1:doc"));
        assert!(!glob_match("rt:topic:*:meta", "rt:topic:t1:doc:subscribers"));
        assert!(glob_match("*", "anything"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry("incr", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StoreError::Unavailable("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("incr", || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n == 0 {
                    Err(StoreError::Deadline)
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .expect("second attempt succeeds");
        assert_eq!(result, 1);
    }

    #[tokio::test]
    async fn retry_does_not_touch_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry("incr", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StoreError::Protocol("bad reply".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Protocol(_))));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
