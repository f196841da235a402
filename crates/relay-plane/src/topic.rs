use crate::store_err;
use bytes::Bytes;
use chrono::Utc;
use relay_common::{keys, EventEnvelope, EventType, PlaneConfig, PlaneError, PlaneResult};
use relay_store::{StoreApi, StreamEntry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const SUBSCRIBER_TTL: Duration = Duration::from_secs(3600);
const TOPIC_META_TTL: Duration = Duration::from_secs(24 * 3600);
// Coalescing kicks in once the queue crosses three quarters of its cap.
const COALESCE_NUM: usize = 3;
const COALESCE_DEN: usize = 4;
const REPLAY_MAX: usize = 1000;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStats {
    pub subscriber_count: usize,
    pub buffer_size: usize,
}

/// Topic state owner: sequence allocation, durable append, the
/// subscriber registry, bounded per-subscriber queues with coalescing, and
/// the backlog read that powers replay.
///
/// Topics have no explicit creation step; first reference materializes the
/// counter, stream, and metadata keys.
pub struct TopicManager {
    store: Arc<dyn StoreApi>,
    config: PlaneConfig,
}

impl TopicManager {
    pub fn new(store: Arc<dyn StoreApi>, config: PlaneConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PlaneConfig {
        &self.config
    }

    /// Assign the next sequence, append durably, announce to all replicas,
    /// then trim the tail. Steps are not one transaction: the stream entry
    /// carries its authoritative `seq`, so consumers that miss the announce
    /// recover by ranging the stream.
    pub async fn append(&self, env: &mut EventEnvelope) -> PlaneResult<()> {
        let prefix = &self.config.prefix;
        let tenant = env.tenant_id.clone();
        let topic = env.topic_id.clone();

        let seq = self
            .store
            .incr(&keys::seq(prefix, &tenant, &topic))
            .await
            .map_err(store_err)?;
        env.seq = seq;

        let stream_key = keys::stream(prefix, &tenant, &topic);
        let fields = [
            ("id", env.id.to_string()),
            ("type", env.event_type.as_str().to_string()),
            ("data", env.data.get().to_string()),
            ("seq", seq.to_string()),
            ("ts", env.ts.to_rfc3339()),
            ("userId", env.sender_id.clone()),
        ];
        self.store
            .stream_append(&stream_key, &fields)
            .await
            .map_err(store_err)?;

        let meta_key = keys::topic_meta(prefix, &tenant, &topic);
        let mut meta = vec![("lastEventId", seq.to_string())];
        if seq == 1 {
            meta.push(("createdAt", env.ts.to_rfc3339()));
        }
        self.store
            .hash_set(&meta_key, &meta)
            .await
            .map_err(store_err)?;
        self.store
            .expire(&meta_key, TOPIC_META_TTL)
            .await
            .map_err(store_err)?;

        let wire = env
            .to_wire()
            .map_err(|err| PlaneError::Internal(format!("encode envelope: {err}")))?;
        self.store
            .publish(
                &keys::publish_channel(prefix, &tenant, &topic),
                Bytes::from(wire),
            )
            .await
            .map_err(store_err)?;

        // Trim is best effort; the next append will converge the length.
        if let Err(err) = self
            .store
            .stream_trim_approx(&stream_key, self.config.max_topic_buffer)
            .await
        {
            tracing::debug!(stream = %stream_key, error = %err, "stream trim failed");
        }
        Ok(())
    }

    pub async fn add_subscriber(
        &self,
        tenant: &str,
        topic: &str,
        sub_id: &str,
        user: &str,
    ) -> PlaneResult<()> {
        let prefix = &self.config.prefix;
        let meta_key = keys::subscriber_meta(prefix, tenant, sub_id);
        let now_ms = Utc::now().timestamp_millis().to_string();
        self.store
            .hash_set(
                &meta_key,
                &[
                    ("userId", user.to_string()),
                    ("topicId", topic.to_string()),
                    ("lastSeen", now_ms),
                    ("isActive", "1".to_string()),
                ],
            )
            .await
            .map_err(store_err)?;
        self.store
            .expire(&meta_key, SUBSCRIBER_TTL)
            .await
            .map_err(store_err)?;
        self.store
            .set_add(&keys::topic_subscribers(prefix, tenant, topic), sub_id)
            .await
            .map_err(store_err)
    }

    pub async fn remove_subscriber(
        &self,
        tenant: &str,
        topic: &str,
        sub_id: &str,
    ) -> PlaneResult<()> {
        let prefix = &self.config.prefix;
        self.store
            .set_rem(&keys::topic_subscribers(prefix, tenant, topic), sub_id)
            .await
            .map_err(store_err)?;
        self.store
            .delete(&keys::subscriber_meta(prefix, tenant, sub_id))
            .await
            .map_err(store_err)?;
        self.store
            .delete(&keys::subscriber_queue(prefix, tenant, sub_id, topic))
            .await
            .map_err(store_err)
    }

    /// Refresh liveness; called by the owning stream while it is draining.
    pub async fn touch_subscriber(&self, tenant: &str, sub_id: &str) -> PlaneResult<()> {
        let meta_key = keys::subscriber_meta(&self.config.prefix, tenant, sub_id);
        let now_ms = Utc::now().timestamp_millis().to_string();
        self.store
            .hash_set(&meta_key, &[("lastSeen", now_ms)])
            .await
            .map_err(store_err)?;
        self.store
            .expire(&meta_key, SUBSCRIBER_TTL)
            .await
            .map_err(store_err)
    }

    /// Flag a subscriber for the reaper without tearing it down inline.
    pub async fn mark_inactive(&self, tenant: &str, sub_id: &str) -> PlaneResult<()> {
        let meta_key = keys::subscriber_meta(&self.config.prefix, tenant, sub_id);
        self.store
            .hash_set(&meta_key, &[("isActive", "0".to_string())])
            .await
            .map_err(store_err)
    }

    /// Append one envelope to a subscriber's bounded queue.
    ///
    /// Cursor and presence events coalesce once the queue is nearly full:
    /// older entries from the same sender carry no information the newest
    /// one does not, and shedding them cuts delivery lag for slow clients
    /// without changing what any other event class observes.
    pub async fn enqueue(
        &self,
        tenant: &str,
        topic: &str,
        sub_id: &str,
        env: &EventEnvelope,
    ) -> PlaneResult<()> {
        let prefix = &self.config.prefix;
        let key = keys::subscriber_queue(prefix, tenant, sub_id, topic);
        let cap = self.config.max_subscriber_queue;

        if env.event_type.coalescible() {
            let len = self.store.list_len(&key).await.map_err(store_err)?;
            if len * COALESCE_DEN >= cap * COALESCE_NUM {
                self.coalesce(&key, &env.event_type, &env.sender_id).await?;
            }
        }

        let wire = env
            .to_wire()
            .map_err(|err| PlaneError::Internal(format!("encode envelope: {err}")))?;
        let new_len = self
            .store
            .list_push(&key, Bytes::from(wire))
            .await
            .map_err(store_err)?;

        if new_len > cap {
            let overflow = new_len - cap;
            self.store
                .list_trim(&key, overflow as i64, -1)
                .await
                .map_err(store_err)?;
            metrics::counter!("events.dropped").increment(overflow as u64);
        }

        self.store
            .expire(&key, SUBSCRIBER_TTL)
            .await
            .map_err(store_err)
    }

    async fn coalesce(
        &self,
        key: &str,
        event_type: &EventType,
        sender: &str,
    ) -> PlaneResult<()> {
        let entries = self
            .store
            .list_range(key, 0, -1)
            .await
            .map_err(store_err)?;
        for raw in entries {
            let Ok(queued) = EventEnvelope::from_wire(&raw) else {
                continue;
            };
            if queued.event_type == *event_type && queued.sender_id == sender {
                if let Err(err) = self.store.list_rem(key, &raw).await {
                    tracing::debug!(queue = %key, error = %err, "coalesce removal failed");
                }
            }
        }
        Ok(())
    }

    /// Drain up to `max` envelopes from the head of a subscriber queue,
    /// refreshing its liveness. The owning stream is the only caller.
    pub async fn drain_queue(
        &self,
        tenant: &str,
        topic: &str,
        sub_id: &str,
        max: usize,
    ) -> PlaneResult<Vec<EventEnvelope>> {
        let key = keys::subscriber_queue(&self.config.prefix, tenant, sub_id, topic);
        let raw = self
            .store
            .list_range(&key, 0, max.saturating_sub(1) as i64)
            .await
            .map_err(store_err)?;
        if !raw.is_empty() {
            self.store
                .list_trim(&key, raw.len() as i64, -1)
                .await
                .map_err(store_err)?;
        }
        self.touch_subscriber(tenant, sub_id).await?;
        Ok(raw
            .iter()
            .filter_map(|bytes| EventEnvelope::from_wire(bytes).ok())
            .collect())
    }

    /// Backlog read for replay: ascending entries with `seq >= from_seq`,
    /// bounded by the durable tail. A `from_seq` older than the tail's
    /// minimum yields whatever remains; reconciliation is the caller's job.
    pub async fn read_from_seq(
        &self,
        tenant: &str,
        topic: &str,
        from_seq: u64,
        max: usize,
    ) -> PlaneResult<Vec<EventEnvelope>> {
        let stream_key = keys::stream(&self.config.prefix, tenant, topic);
        let entries = self
            .store
            .stream_range_from(&stream_key, from_seq, max.min(REPLAY_MAX))
            .await
            .map_err(store_err)?;
        Ok(entries
            .iter()
            .filter_map(|entry| envelope_from_entry(tenant, topic, entry))
            .collect())
    }

    pub async fn topic_stats(&self, tenant: &str, topic: &str) -> PlaneResult<TopicStats> {
        let prefix = &self.config.prefix;
        let subscriber_count = self
            .store
            .set_card(&keys::topic_subscribers(prefix, tenant, topic))
            .await
            .map_err(store_err)?;
        let buffer_size = self
            .store
            .stream_len(&keys::stream(prefix, tenant, topic))
            .await
            .map_err(store_err)?;
        Ok(TopicStats {
            subscriber_count,
            buffer_size,
        })
    }

    /// Sweep every known topic and drop subscribers that are flagged
    /// inactive, expired, or quiet past the slow-client threshold. Runs on
    /// a 30 s period from the gateway.
    pub async fn reap_inactive(&self) -> PlaneResult<usize> {
        let prefix = self.config.prefix.clone();
        let meta_keys = self
            .store
            .keys_by_pattern(&keys::topic_meta_pattern(&prefix))
            .await
            .map_err(store_err)?;
        metrics::gauge!("topics.active").set(meta_keys.len() as f64);

        let now_ms = Utc::now().timestamp_millis();
        let threshold = self.config.slow_client_threshold_ms as i64;
        let mut reaped = 0usize;
        let mut live = 0usize;

        for meta_key in meta_keys {
            let Some((tenant, topic)) = keys::parse_topic_meta(&prefix, &meta_key) else {
                continue;
            };
            let subscribers = self
                .store
                .set_members(&keys::topic_subscribers(&prefix, tenant, topic))
                .await
                .map_err(store_err)?;
            for sub_id in subscribers {
                let meta = self
                    .store
                    .hash_get_all(&keys::subscriber_meta(&prefix, tenant, &sub_id))
                    .await
                    .unwrap_or_default();
                if subscriber_is_stale(&meta, now_ms, threshold) {
                    if let Err(err) = self.remove_subscriber(tenant, topic, &sub_id).await {
                        tracing::debug!(sub = %sub_id, error = %err, "reap removal failed");
                        continue;
                    }
                    tracing::debug!(tenant, topic, sub = %sub_id, "reaped inactive subscriber");
                    reaped += 1;
                } else {
                    live += 1;
                }
            }
        }
        metrics::gauge!("subscribers.active").set(live as f64);
        Ok(reaped)
    }
}

fn subscriber_is_stale(meta: &[(String, String)], now_ms: i64, threshold_ms: i64) -> bool {
    if meta.is_empty() {
        // Metadata TTL already expired; only the set entry remains.
        return true;
    }
    let field = |name: &str| {
        meta.iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };
    if field("isActive") == Some("0") {
        return true;
    }
    match field("lastSeen").and_then(|value| value.parse::<i64>().ok()) {
        Some(last_seen) => now_ms.saturating_sub(last_seen) > threshold_ms,
        None => true,
    }
}

fn envelope_from_entry(tenant: &str, topic: &str, entry: &StreamEntry) -> Option<EventEnvelope> {
    let id = entry.field("id")?.parse().ok()?;
    let event_type = EventType::from(entry.field("type")?.to_string());
    let data = serde_json::value::RawValue::from_string(entry.field("data")?.to_string()).ok()?;
    let ts = chrono::DateTime::parse_from_rfc3339(entry.field("ts")?)
        .ok()?
        .with_timezone(&Utc);
    Some(EventEnvelope {
        id,
        topic_id: topic.to_string(),
        tenant_id: tenant.to_string(),
        sender_id: entry.field("userId")?.to_string(),
        event_type,
        data,
        seq: entry.seq,
        ts,
        priority: None,
    })
}
