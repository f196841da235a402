use crate::bus::{topic_channel, BroadcastBus};
use crate::topic::TopicManager;
use futures::future::join_all;
use relay_common::{keys, EventEnvelope};
use relay_store::{PubSubMessage, StoreApi};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);
const RECENT_IDS_CAP: usize = 1024;

/// Bounded set of envelope ids published from this replica. The publish
/// path inserts before the store announce; the distributor takes the id
/// back out instead of re-broadcasting, so same-replica consumers see one
/// copy while every other replica still gets its own.
pub struct RecentIds {
    inner: Mutex<(VecDeque<Uuid>, HashSet<Uuid>)>,
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new()
    }
}

impl RecentIds {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    pub fn insert(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("recent ids lock");
        if inner.1.insert(id) {
            inner.0.push_back(id);
            while inner.0.len() > RECENT_IDS_CAP {
                if let Some(evicted) = inner.0.pop_front() {
                    inner.1.remove(&evicted);
                }
            }
        }
    }

    /// Returns true iff the id was present; the id is consumed.
    pub fn take(&self, id: &Uuid) -> bool {
        let mut inner = self.inner.lock().expect("recent ids lock");
        if inner.1.remove(id) {
            inner.0.retain(|queued| queued != id);
            true
        } else {
            false
        }
    }
}

/// Cross-replica fan-in: one pattern subscription over every tenant's
/// publish channel, feeding local durable queues and the in-process bus.
pub struct EventDistributor {
    store: Arc<dyn StoreApi>,
    topics: Arc<TopicManager>,
    bus: Arc<BroadcastBus>,
    local_ids: Arc<RecentIds>,
    prefix: String,
    // Rotating start index per {tenant, topic}; replica-local and advisory.
    rotation: Mutex<HashMap<(String, String), usize>>,
}

impl EventDistributor {
    pub fn new(
        store: Arc<dyn StoreApi>,
        topics: Arc<TopicManager>,
        bus: Arc<BroadcastBus>,
        local_ids: Arc<RecentIds>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            topics,
            bus,
            local_ids,
            prefix: prefix.into(),
            rotation: Mutex::new(HashMap::new()),
        }
    }

    /// Long-lived receive loop. Re-subscribes with backoff whenever the
    /// pattern subscription drops; events published while the link is down
    /// stay recoverable through the durable tail.
    pub async fn run(self: Arc<Self>) {
        let pattern = keys::publish_pattern(&self.prefix);
        loop {
            match self.store.pattern_subscribe(&pattern).await {
                Ok(mut messages) => {
                    tracing::info!(pattern = %pattern, "distributor subscribed");
                    while let Some(message) = messages.recv().await {
                        self.dispatch(message).await;
                    }
                    tracing::warn!("distributor subscription closed, resubscribing");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "distributor subscribe failed, retrying");
                }
            }
            tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
        }
    }

    pub async fn dispatch(&self, message: PubSubMessage) {
        let Some((tenant, topic)) = keys::parse_publish_channel(&self.prefix, &message.channel)
        else {
            tracing::debug!(channel = %message.channel, "ignoring unparseable channel");
            return;
        };
        let envelope = match EventEnvelope::from_wire(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(channel = %message.channel, error = %err, "dropping undecodable event");
                metrics::counter!("errors.total", "kind" => "internal").increment(1);
                return;
            }
        };

        let subscribers = match self
            .store
            .set_members(&keys::topic_subscribers(&self.prefix, tenant, topic))
            .await
        {
            Ok(subscribers) => subscribers,
            Err(err) => {
                tracing::warn!(tenant, topic, error = %err, "subscriber set read failed");
                Vec::new()
            }
        };

        if !subscribers.is_empty() {
            let rotated = self.rotate(tenant, topic, subscribers);
            let results = join_all(rotated.iter().map(|sub_id| {
                let envelope = &envelope;
                async move {
                    (
                        sub_id,
                        self.topics.enqueue(tenant, topic, sub_id, envelope).await,
                    )
                }
            }))
            .await;

            let mut delivered = 0u64;
            for (sub_id, result) in results {
                match result {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        // A failed enqueue flags the subscriber for the
                        // reaper; distribution to the others continues.
                        tracing::debug!(sub = %sub_id, error = %err, "enqueue failed, flagging subscriber");
                        let _ = self.topics.mark_inactive(tenant, sub_id).await;
                    }
                }
            }
            metrics::counter!("events.delivered").increment(delivered);
        }

        // The producing replica already put this envelope on its bus.
        if !self.local_ids.take(&envelope.id) {
            self.bus.publish(&topic_channel(tenant, topic), envelope);
        }
    }

    /// Rotate the subscriber list so saturated topics spread first-enqueue
    /// position across subscribers, approximating deficit round-robin.
    fn rotate(&self, tenant: &str, topic: &str, subscribers: Vec<String>) -> Vec<String> {
        if subscribers.len() <= 1 {
            return subscribers;
        }
        let mut rotation = self.rotation.lock().expect("rotation lock");
        let start = rotation
            .entry((tenant.to_string(), topic.to_string()))
            .or_insert(0);
        let offset = *start % subscribers.len();
        *start = (offset + 1) % subscribers.len();
        let mut rotated = Vec::with_capacity(subscribers.len());
        rotated.extend_from_slice(&subscribers[offset..]);
        rotated.extend_from_slice(&subscribers[..offset]);
        rotated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::{EventType, PlaneConfig, Principal};
    use relay_store::MemoryStore;

    fn distributor(store: Arc<MemoryStore>) -> Arc<EventDistributor> {
        let topics = Arc::new(TopicManager::new(store.clone(), PlaneConfig::default()));
        Arc::new(EventDistributor::new(
            store,
            topics,
            Arc::new(BroadcastBus::default()),
            Arc::new(RecentIds::new()),
            "rt",
        ))
    }

    fn envelope(seq: u64) -> EventEnvelope {
        let data = serde_json::value::to_raw_value(&serde_json::json!({})).expect("raw");
        let mut env = EventEnvelope::seal(
            &Principal::new("u1", "t1"),
            "doc:1",
            EventType::Op,
            data,
            None,
        );
        env.seq = seq;
        env
    }

    #[test]
    fn rotation_advances_per_delivery() {
        let store = Arc::new(MemoryStore::new());
        let distributor = distributor(store);
        let subs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(
            distributor.rotate("t1", "doc:1", subs.clone()),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            distributor.rotate("t1", "doc:1", subs.clone()),
            vec!["b", "c", "a"]
        );
        assert_eq!(
            distributor.rotate("t1", "doc:1", subs.clone()),
            vec!["c", "a", "b"]
        );
        assert_eq!(distributor.rotate("t1", "doc:1", subs), vec!["a", "b", "c"]);
    }

    #[test]
    fn rotation_is_per_topic() {
        let store = Arc::new(MemoryStore::new());
        let distributor = distributor(store);
        let subs = vec!["a".to_string(), "b".to_string()];
        assert_eq!(distributor.rotate("t1", "x", subs.clone()), vec!["a", "b"]);
        assert_eq!(distributor.rotate("t1", "y", subs.clone()), vec!["a", "b"]);
        assert_eq!(distributor.rotate("t1", "x", subs), vec!["b", "a"]);
    }

    #[test]
    fn recent_ids_consume_once() {
        let ids = RecentIds::new();
        let id = Uuid::new_v4();
        ids.insert(id);
        assert!(ids.take(&id));
        assert!(!ids.take(&id));
    }

    #[test]
    fn recent_ids_bounded() {
        let ids = RecentIds::new();
        let first = Uuid::new_v4();
        ids.insert(first);
        for _ in 0..RECENT_IDS_CAP {
            ids.insert(Uuid::new_v4());
        }
        assert!(!ids.take(&first));
    }

    #[tokio::test]
    async fn dispatch_enqueues_to_registered_subscribers() {
        let store = Arc::new(MemoryStore::new());
        let topics = Arc::new(TopicManager::new(store.clone(), PlaneConfig::default()));
        let bus = Arc::new(BroadcastBus::default());
        let distributor = EventDistributor::new(
            store.clone(),
            topics.clone(),
            bus.clone(),
            Arc::new(RecentIds::new()),
            "rt",
        );
        topics
            .add_subscriber("t1", "doc:1", "s1", "u2")
            .await
            .expect("register");

        let env = envelope(1);
        distributor
            .dispatch(PubSubMessage {
                channel: "rt:pub:t1:doc:1".to_string(),
                payload: bytes::Bytes::from(env.to_wire().expect("wire")),
            })
            .await;

        let drained = topics
            .drain_queue("t1", "doc:1", "s1", 10)
            .await
            .expect("drain");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].seq, 1);
    }

    #[tokio::test]
    async fn dispatch_forwards_to_bus_unless_locally_published() {
        let store = Arc::new(MemoryStore::new());
        let topics = Arc::new(TopicManager::new(store.clone(), PlaneConfig::default()));
        let bus = Arc::new(BroadcastBus::default());
        let local_ids = Arc::new(RecentIds::new());
        let distributor = EventDistributor::new(
            store,
            topics,
            bus.clone(),
            local_ids.clone(),
            "rt",
        );
        let mut rx = bus.subscribe(&topic_channel("t1", "doc:1"));

        let remote = envelope(1);
        distributor
            .dispatch(PubSubMessage {
                channel: "rt:pub:t1:doc:1".to_string(),
                payload: bytes::Bytes::from(remote.to_wire().expect("wire")),
            })
            .await;
        assert_eq!(rx.recv().await.expect("remote event").seq, 1);

        let local = envelope(2);
        local_ids.insert(local.id);
        distributor
            .dispatch(PubSubMessage {
                channel: "rt:pub:t1:doc:1".to_string(),
                payload: bytes::Bytes::from(local.to_wire().expect("wire")),
            })
            .await;
        assert!(rx.try_recv().is_err(), "local publish must not re-broadcast");
    }

    #[tokio::test]
    async fn dispatch_ignores_foreign_channels_and_garbage() {
        let store = Arc::new(MemoryStore::new());
        let distributor = distributor(store);
        distributor
            .dispatch(PubSubMessage {
                channel: "other:pub:t1:doc:1".to_string(),
                payload: bytes::Bytes::from_static(b"{}"),
            })
            .await;
        distributor
            .dispatch(PubSubMessage {
                channel: "rt:pub:t1:doc:1".to_string(),
                payload: bytes::Bytes::from_static(b"not json"),
            })
            .await;
    }
}
