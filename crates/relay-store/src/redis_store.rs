use crate::{
    with_retry, CircuitBreaker, PubSubMessage, RateDecision, StoreApi, StoreError, StoreResult,
    StreamEntry,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(2);
const PATTERN_CHANNEL_DEPTH: usize = 1024;

// Atomic sliding window, entirely on the store clock: prune the window,
// admit if below the limit, stamp a monotonic member id, refresh TTLs.
const RATE_LIMIT_SCRIPT: &str = r"
local time = redis.call('TIME')
local now = tonumber(time[1])
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < limit then
  local id = redis.call('INCR', KEYS[2])
  redis.call('ZADD', KEYS[1], now, id)
  redis.call('EXPIRE', KEYS[2], window)
  count = count + 1
  allowed = 1
end
redis.call('EXPIRE', KEYS[1], window)
local reset = window
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
  reset = (tonumber(oldest[2]) + window) - now
  if reset < 0 then reset = 0 end
end
return {allowed, limit - count, reset, limit}
";

fn map_redis_err(err: redis::RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

/// Redis-backed store. One multiplexed connection serves commands; pattern
/// subscriptions each duplicate a dedicated connection off the client, as
/// blocking subscribe state cannot share the command link.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    breaker: Arc<CircuitBreaker>,
    deadline: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(map_redis_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(map_redis_err)?;
        Ok(Self {
            client,
            conn,
            breaker: Arc::new(CircuitBreaker::new()),
            deadline: DEFAULT_DEADLINE,
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run one command under the per-call deadline and the breaker.
    async fn guarded<T, Fut>(&self, fut: Fut) -> StoreResult<T>
    where
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        if !self.breaker.allow() {
            return Err(StoreError::Unavailable("circuit open".to_string()));
        }
        match tokio::time::timeout(self.deadline, fut).await {
            Err(_) => {
                self.breaker.record_failure();
                Err(StoreError::Deadline)
            }
            Ok(Err(err)) => {
                let mapped = map_redis_err(err);
                match mapped {
                    StoreError::Protocol(_) => {
                        // An error reply still proves the link is alive.
                        self.breaker.record_success();
                    }
                    _ => self.breaker.record_failure(),
                }
                Err(mapped)
            }
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
        }
    }
}

#[async_trait]
impl StoreApi for RedisStore {
    async fn stream_append(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let mut conn = self.conn.clone();
        self.guarded(async move { cmd.query_async::<String>(&mut conn).await })
            .await
    }

    async fn stream_range_from(
        &self,
        key: &str,
        min_seq: u64,
        max: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let raw: Vec<(String, HashMap<String, String>)> = self
            .guarded(async move {
                redis::cmd("XRANGE")
                    .arg(&key)
                    .arg("-")
                    .arg("+")
                    .arg("COUNT")
                    .arg(max)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|(entry_id, fields)| {
                let seq = fields.get("seq")?.parse().ok()?;
                Some(StreamEntry {
                    entry_id,
                    seq,
                    fields: fields.into_iter().collect(),
                })
            })
            .filter(|entry| entry.seq >= min_seq)
            .collect())
    }

    async fn stream_trim_approx(&self, key: &str, cap: usize) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move {
            redis::cmd("XTRIM")
                .arg(&key)
                .arg("MAXLEN")
                .arg("~")
                .arg(cap)
                .query_async::<i64>(&mut conn)
                .await
        })
        .await?;
        Ok(())
    }

    async fn stream_len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move {
            redis::cmd("XLEN")
                .arg(&key)
                .query_async::<usize>(&mut conn)
                .await
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> StoreResult<()> {
        // Idempotent per the propagation policy: a duplicate publish is
        // absorbed by consumer-side dedup.
        with_retry("publish", || {
            let mut conn = self.conn.clone();
            let channel = channel.to_string();
            let payload = payload.clone();
            async move {
                self.guarded(async move {
                    conn.publish::<_, _, i64>(&channel, payload.as_ref()).await
                })
                .await
                .map(|_receivers| ())
            }
        })
        .await
    }

    async fn pattern_subscribe(
        &self,
        pattern: &str,
    ) -> StoreResult<mpsc::Receiver<PubSubMessage>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_redis_err)?;
        pubsub.psubscribe(pattern).await.map_err(map_redis_err)?;
        let (tx, rx) = mpsc::channel(PATTERN_CHANNEL_DEPTH);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let forwarded = PubSubMessage {
                    channel: message.get_channel_name().to_string(),
                    payload: Bytes::copy_from_slice(message.get_payload_bytes()),
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
            tracing::debug!(pattern = %pattern, "pattern subscription closed");
        });
        Ok(rx)
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        with_retry("incr", || {
            let mut conn = self.conn.clone();
            let key = key.to_string();
            async move {
                self.guarded(async move { conn.incr::<_, _, u64>(&key, 1u64).await })
                    .await
            }
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move { conn.get::<_, Option<String>>(&key).await })
            .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        let secs = ttl.as_secs().max(1);
        self.guarded(async move { conn.set_ex::<_, _, ()>(&key, &value, secs).await })
            .await
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        with_retry("hash_get_all", || {
            let mut conn = self.conn.clone();
            let key = key.to_string();
            async move {
                self.guarded(async move {
                    conn.hgetall::<_, HashMap<String, String>>(&key).await
                })
                .await
                .map(|map| map.into_iter().collect())
            }
        })
        .await
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let mut conn = self.conn.clone();
        self.guarded(async move { cmd.query_async::<i64>(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let field = field.to_string();
        self.guarded(async move { conn.hdel::<_, _, i64>(&key, &field).await })
            .await?;
        Ok(())
    }

    async fn hash_keys(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move { conn.hkeys::<_, Vec<String>>(&key).await })
            .await
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let member = member.to_string();
        self.guarded(async move { conn.sadd::<_, _, i64>(&key, &member).await })
            .await?;
        Ok(())
    }

    async fn set_rem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let member = member.to_string();
        self.guarded(async move { conn.srem::<_, _, i64>(&key, &member).await })
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let mut members = self
            .guarded(async move { conn.smembers::<_, Vec<String>>(&key).await })
            .await?;
        members.sort_unstable();
        Ok(members)
    }

    async fn set_card(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move { conn.scard::<_, usize>(&key).await })
            .await
    }

    async fn list_push(&self, key: &str, value: Bytes) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move { conn.rpush::<_, _, usize>(&key, value.as_ref()).await })
            .await
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let raw = self
            .guarded(async move { conn.lrange::<_, Vec<Vec<u8>>>(&key, start as isize, stop as isize).await })
            .await?;
        Ok(raw.into_iter().map(Bytes::from).collect())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move {
            conn.ltrim::<_, ()>(&key, start as isize, stop as isize).await
        })
        .await
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move { conn.llen::<_, usize>(&key).await })
            .await
    }

    async fn list_rem(&self, key: &str, value: &Bytes) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let value = value.clone();
        self.guarded(async move {
            conn.lrem::<_, _, usize>(&key, 0, value.as_ref()).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.guarded(async move { conn.del::<_, i64>(&key).await })
            .await?;
        Ok(())
    }

    async fn keys_by_pattern(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = pattern.to_string();
        self.guarded(async move { conn.keys::<_, Vec<String>>(&pattern).await })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let secs = ttl.as_secs().max(1) as i64;
        self.guarded(async move { conn.expire::<_, i64>(&key, secs).await })
            .await?;
        Ok(())
    }

    async fn rate_limit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> StoreResult<RateDecision> {
        let script = redis::Script::new(RATE_LIMIT_SCRIPT);
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let id_key = format!("{key}:id");
        let window_secs = window.as_secs().max(1);
        let (allowed, remaining, reset, limit_out): (i64, i64, i64, i64) = self
            .guarded(async move {
                script
                    .key(&key)
                    .key(&id_key)
                    .arg(window_secs)
                    .arg(limit)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(RateDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u32,
            reset_after_secs: reset.max(0) as u64,
            limit: limit_out.max(0) as u32,
        })
    }
}
