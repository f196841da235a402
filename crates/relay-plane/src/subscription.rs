use crate::bus::{topic_channel, BroadcastBus};
use crate::topic::TopicManager;
use relay_common::EventEnvelope;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const REPLAY_BATCH_MAX: usize = 1000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub topic_id: String,
    #[serde(default)]
    pub from_seq: Option<u64>,
}

/// Handle owned by the transport for one active subscriber stream.
///
/// Dropping the handle (or the transport closing) ends the stream task,
/// which always runs its cleanup edge: deregistration and queue removal
/// happen on graceful close, timeout, and abrupt loss alike.
pub struct Subscription {
    subscriber_id: String,
    events: mpsc::Receiver<EventEnvelope>,
}

impl Subscription {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Next envelope, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        self.events.recv().await
    }

    /// Server-side cancel; the stream task observes the closed channel and
    /// cleans up.
    pub fn close(&mut self) {
        self.events.close();
    }

    /// Drive REPLAY then TAIL on a spawned task. The bus subscription is
    /// installed before the backlog read so nothing published during replay
    /// can fall into a gap; anything replayed and then seen live again is
    /// filtered by `seq` here, and consumers still dedupe by `id` across
    /// reconnects.
    pub(crate) fn spawn(
        topics: Arc<TopicManager>,
        bus: Arc<BroadcastBus>,
        tenant: String,
        topic: String,
        subscriber_id: String,
        from_seq: Option<u64>,
    ) -> Self {
        let mut live = bus.subscribe(&topic_channel(&tenant, &topic));
        let queue_cap = topics.config().max_subscriber_queue.max(1);
        let touch_every =
            Duration::from_millis((topics.config().slow_client_threshold_ms / 2).max(1000));
        let (tx, rx) = mpsc::channel(queue_cap);
        let sub_id = subscriber_id.clone();

        tokio::spawn(async move {
            let mut replayed_max = 0u64;

            if let Some(from_seq) = from_seq {
                match topics
                    .read_from_seq(&tenant, &topic, from_seq, REPLAY_BATCH_MAX)
                    .await
                {
                    Ok(backlog) => {
                        for envelope in backlog {
                            replayed_max = replayed_max.max(envelope.seq);
                            if tx.send(envelope).await.is_err() {
                                cleanup(&topics, &tenant, &topic, &sub_id).await;
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        // Degrade to live-only rather than failing the
                        // stream; the client reconciles once the store is
                        // back.
                        tracing::warn!(tenant, topic, error = %err, "replay unavailable, continuing live");
                    }
                }
            }

            let mut touch = tokio::time::interval(touch_every);
            touch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = touch.tick() => {
                        if let Err(err) = topics.touch_subscriber(&tenant, &sub_id).await {
                            tracing::debug!(sub = %sub_id, error = %err, "liveness touch failed");
                        }
                    }
                    received = live.recv() => match received {
                        Ok(envelope) => {
                            if envelope.seq != 0 && envelope.seq <= replayed_max {
                                continue;
                            }
                            if tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // The durable queue is the backpressure path;
                            // the bus only serves receivers that keep up.
                            metrics::counter!("events.dropped").increment(skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            cleanup(&topics, &tenant, &topic, &sub_id).await;
        });

        Self {
            subscriber_id,
            events: rx,
        }
    }
}

async fn cleanup(topics: &TopicManager, tenant: &str, topic: &str, sub_id: &str) {
    if let Err(err) = topics.remove_subscriber(tenant, topic, sub_id).await {
        tracing::debug!(sub = %sub_id, error = %err, "subscriber cleanup failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::{EventType, PlaneConfig, Principal};
    use relay_store::MemoryStore;
    use serde_json::json;

    fn envelope(n: u64) -> EventEnvelope {
        let data = serde_json::value::to_raw_value(&json!({ "n": n })).expect("raw");
        EventEnvelope::seal(
            &Principal::new("u1", "t1"),
            "doc:1",
            EventType::Op,
            data,
            None,
        )
    }

    async fn fixture() -> (Arc<MemoryStore>, Arc<TopicManager>, Arc<BroadcastBus>) {
        let store = Arc::new(MemoryStore::new());
        let topics = Arc::new(TopicManager::new(store.clone(), PlaneConfig::default()));
        (store, topics, Arc::new(BroadcastBus::default()))
    }

    #[tokio::test]
    async fn live_tail_delivers_bus_events() {
        let (_store, topics, bus) = fixture().await;
        topics
            .add_subscriber("t1", "doc:1", "s1", "u2")
            .await
            .expect("register");
        let mut sub = Subscription::spawn(
            topics,
            bus.clone(),
            "t1".into(),
            "doc:1".into(),
            "s1".into(),
            None,
        );
        tokio::task::yield_now().await;
        let mut env = envelope(1);
        env.seq = 1;
        bus.publish(&topic_channel("t1", "doc:1"), env);
        let received = sub.next_event().await.expect("live event");
        assert_eq!(received.seq, 1);
    }

    #[tokio::test]
    async fn replay_then_tail_is_gap_free_and_ascending() {
        let (_store, topics, bus) = fixture().await;
        for _ in 1..=3 {
            let mut env = envelope(0);
            topics.append(&mut env).await.expect("append");
        }
        topics
            .add_subscriber("t1", "doc:1", "s1", "u2")
            .await
            .expect("register");
        let mut sub = Subscription::spawn(
            topics.clone(),
            bus.clone(),
            "t1".into(),
            "doc:1".into(),
            "s1".into(),
            Some(2),
        );
        assert_eq!(sub.next_event().await.expect("replay").seq, 2);
        assert_eq!(sub.next_event().await.expect("replay").seq, 3);

        let mut live = envelope(0);
        live.seq = 4;
        // Wait for the task to reach its tail loop before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(&topic_channel("t1", "doc:1"), live);
        assert_eq!(sub.next_event().await.expect("live").seq, 4);
    }

    #[tokio::test]
    async fn tail_filters_events_already_replayed() {
        let (_store, topics, bus) = fixture().await;
        for _ in 1..=2 {
            let mut env = envelope(0);
            topics.append(&mut env).await.expect("append");
        }
        topics
            .add_subscriber("t1", "doc:1", "s1", "u2")
            .await
            .expect("register");
        let mut sub = Subscription::spawn(
            topics.clone(),
            bus.clone(),
            "t1".into(),
            "doc:1".into(),
            "s1".into(),
            Some(1),
        );
        assert_eq!(sub.next_event().await.expect("replay").seq, 1);
        assert_eq!(sub.next_event().await.expect("replay").seq, 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // A live copy of seq 2 raced the replay; the stream drops it.
        let mut raced = envelope(0);
        raced.seq = 2;
        bus.publish(&topic_channel("t1", "doc:1"), raced);
        let mut fresh = envelope(0);
        fresh.seq = 3;
        bus.publish(&topic_channel("t1", "doc:1"), fresh);
        assert_eq!(sub.next_event().await.expect("fresh").seq, 3);
    }

    #[tokio::test]
    async fn replay_degrades_to_live_when_store_is_down() {
        let (store, topics, bus) = fixture().await;
        for _ in 1..=2 {
            let mut env = envelope(0);
            topics.append(&mut env).await.expect("append");
        }
        topics
            .add_subscriber("t1", "doc:1", "s1", "u2")
            .await
            .expect("register");
        store.set_available(false);
        let mut sub = Subscription::spawn(
            topics.clone(),
            bus.clone(),
            "t1".into(),
            "doc:1".into(),
            "s1".into(),
            Some(1),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut live = envelope(0);
        live.seq = 3;
        bus.publish(&topic_channel("t1", "doc:1"), live);
        assert_eq!(sub.next_event().await.expect("live only").seq, 3);
    }

    #[tokio::test]
    async fn dropping_the_handle_deregisters_the_subscriber() {
        let (store, topics, bus) = fixture().await;
        let mut env = envelope(0);
        topics.append(&mut env).await.expect("append");
        topics
            .add_subscriber("t1", "doc:1", "s1", "u2")
            .await
            .expect("register");
        let sub = Subscription::spawn(
            topics.clone(),
            bus,
            "t1".into(),
            "doc:1".into(),
            "s1".into(),
            None,
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(sub);
        // Give the task a moment to observe the close and clean up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = topics.topic_stats("t1", "doc:1").await.expect("stats");
        assert_eq!(stats.subscriber_count, 0);
        let _ = store;
    }
}
