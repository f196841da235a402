#![allow(dead_code)] // Not every test binary uses every helper.

use relay_common::{PlaneConfig, Principal};
use relay_plane::{AllowAll, EventPlane, PublishInput};
use relay_store::MemoryStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One shared in-memory store standing in for the Redis deployment; every
/// plane built against it behaves like one gateway replica.
pub fn shared_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn replica(store: Arc<MemoryStore>, config: PlaneConfig) -> EventPlane {
    EventPlane::new(store, Arc::new(AllowAll), config).expect("event plane")
}

pub fn durable_config() -> PlaneConfig {
    PlaneConfig {
        durability_enabled: true,
        ..PlaneConfig::default()
    }
}

pub fn principal(user: &str, tenant: &str) -> Principal {
    Principal::new(user, tenant)
}

pub fn metric_input(topic: &str, n: u64) -> PublishInput {
    PublishInput {
        topic_id: topic.to_string(),
        event_type: "metric".to_string(),
        data: serde_json::json!({ "n": n }),
        priority: None,
    }
}

pub fn typed_input(topic: &str, event_type: &str, n: u64) -> PublishInput {
    PublishInput {
        topic_id: topic.to_string(),
        event_type: event_type.to_string(),
        data: serde_json::json!({ "n": n }),
        priority: None,
    }
}

/// Poll until `probe` reports true or the deadline passes. Background tasks
/// (distributor, reaper) make some effects asynchronous even against the
/// in-memory store.
pub async fn wait_until<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give freshly spawned background tasks a beat to install subscriptions.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
