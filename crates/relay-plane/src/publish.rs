use crate::acl::AclCache;
use crate::bus::{topic_channel, BroadcastBus};
use crate::distributor::RecentIds;
use crate::limiter::{RateLimiter, SlidingWindowMap};
use crate::topic::TopicManager;
use crate::validate;
use relay_common::{EventEnvelope, PlaneConfig, PlaneError, PlaneResult, Principal};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// Replica-local flood guard, checked before the store is touched.
const INPUT_FREQUENCY_WINDOW: Duration = Duration::from_secs(60);
const INPUT_FREQUENCY_LIMIT: u32 = 50;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishInput {
    pub topic_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct PublishReceipt {
    pub event_id: Uuid,
    pub seq: u64,
}

/// Publish orchestration: validate and sanitize, admit, authorize,
/// seal, then hand the envelope to the topic manager and the local bus.
pub struct PublishPath {
    config: PlaneConfig,
    topics: Arc<TopicManager>,
    limiter: Arc<RateLimiter>,
    acl: Arc<AclCache>,
    bus: Arc<BroadcastBus>,
    local_ids: Arc<RecentIds>,
    input_window: SlidingWindowMap,
}

impl PublishPath {
    pub fn new(
        config: PlaneConfig,
        topics: Arc<TopicManager>,
        limiter: Arc<RateLimiter>,
        acl: Arc<AclCache>,
        bus: Arc<BroadcastBus>,
        local_ids: Arc<RecentIds>,
    ) -> Self {
        Self {
            config,
            topics,
            limiter,
            acl,
            bus,
            local_ids,
            input_window: SlidingWindowMap::new(),
        }
    }

    pub async fn publish_event(
        &self,
        principal: Option<&Principal>,
        input: PublishInput,
    ) -> PlaneResult<PublishReceipt> {
        let principal = principal.ok_or(PlaneError::Unauthorized)?;

        validate::validate_topic_id(&input.topic_id)?;
        let event_type = validate::validate_event_type(&input.event_type)?;
        let priority = validate::validate_priority(input.priority)?;
        validate::validate_data_shape(&input.data)?;
        let data = validate::sanitize_value(input.data);
        let serialized = serde_json::to_string(&data)
            .map_err(|err| PlaneError::Internal(format!("serialize payload: {err}")))?;
        if serialized.len() > self.config.max_payload_bytes {
            return Err(PlaneError::PayloadTooLarge {
                max_bytes: self.config.max_payload_bytes,
            });
        }

        // Flood guard first: replica-local, independent of the store.
        if let Err(reset_after_secs) = self.input_window.check(
            &principal.user_id,
            INPUT_FREQUENCY_WINDOW,
            INPUT_FREQUENCY_LIMIT,
        ) {
            metrics::counter!("rateLimits.blocks").increment(1);
            return Err(PlaneError::RateLimited { reset_after_secs });
        }

        self.limiter
            .check_user_action(&principal.user_id, "publish")
            .await?;
        self.limiter
            .check_topic(&self.config.prefix, &principal.tenant_id, &input.topic_id)
            .await?;
        self.limiter.check_global().await?;

        if !self.acl.check(principal, &input.topic_id).await? {
            return Err(PlaneError::AccessDenied {
                topic: input.topic_id,
            });
        }

        let raw = serde_json::value::RawValue::from_string(serialized)
            .map_err(|err| PlaneError::Internal(format!("payload raw value: {err}")))?;
        let mut envelope =
            EventEnvelope::seal(principal, input.topic_id, event_type, raw, priority);

        self.topics.append(&mut envelope).await?;

        // Same-replica consumers get the envelope straight off the bus; the
        // distributor suppresses the copy that echoes back from the store.
        self.local_ids.insert(envelope.id);
        let receipt = PublishReceipt {
            event_id: envelope.id,
            seq: envelope.seq,
        };
        self.bus.publish(
            &topic_channel(&envelope.tenant_id, &envelope.topic_id),
            envelope,
        );

        metrics::counter!("events.published").increment(1);
        Ok(receipt)
    }

    /// Periodic cleanup for the flood-guard window map.
    pub fn reap_input_window(&self) {
        self.input_window.reap(INPUT_FREQUENCY_WINDOW);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AccessSource, AccessSourceError, AllowAll, FailurePolicy};
    use async_trait::async_trait;
    use relay_store::{MemoryStore, StoreApi};
    use serde_json::json;

    struct DenyAll;

    #[async_trait]
    impl AccessSource for DenyAll {
        async fn check_topic_access(
            &self,
            _principal: &Principal,
            _topic: &str,
        ) -> Result<bool, AccessSourceError> {
            Ok(false)
        }
    }

    fn path_with(store: Arc<MemoryStore>, source: Arc<dyn AccessSource>) -> PublishPath {
        let config = PlaneConfig::default();
        let topics = Arc::new(TopicManager::new(store.clone(), config.clone()));
        let limiter = Arc::new(RateLimiter::new(store.clone(), &config));
        let acl = Arc::new(
            AclCache::new(
                store,
                source,
                &config.prefix,
                FailurePolicy::for_environment(config.environment),
                config.environment,
            )
            .expect("acl"),
        );
        PublishPath::new(
            config,
            topics,
            limiter,
            acl,
            Arc::new(BroadcastBus::default()),
            Arc::new(RecentIds::new()),
        )
    }

    fn input(data: serde_json::Value) -> PublishInput {
        PublishInput {
            topic_id: "doc:123".to_string(),
            event_type: "metric".to_string(),
            data,
            priority: None,
        }
    }

    #[tokio::test]
    async fn publish_assigns_seq_and_reports_id() {
        let store = Arc::new(MemoryStore::new());
        let path = path_with(store, Arc::new(AllowAll));
        let principal = Principal::new("u1", "t1");
        let first = path
            .publish_event(Some(&principal), input(json!({"n": 1})))
            .await
            .expect("publish");
        assert_eq!(first.seq, 1);
        let second = path
            .publish_event(Some(&principal), input(json!({"n": 2})))
            .await
            .expect("publish");
        assert_eq!(second.seq, 2);
        assert_ne!(first.event_id, second.event_id);
    }

    #[tokio::test]
    async fn missing_principal_is_unauthorized() {
        let store = Arc::new(MemoryStore::new());
        let path = path_with(store, Arc::new(AllowAll));
        assert!(matches!(
            path.publish_event(None, input(json!({}))).await,
            Err(PlaneError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn acl_denial_is_access_denied() {
        let store = Arc::new(MemoryStore::new());
        let path = path_with(store, Arc::new(DenyAll));
        let principal = Principal::new("u1", "t1");
        assert!(matches!(
            path.publish_event(Some(&principal), input(json!({}))).await,
            Err(PlaneError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn payload_size_boundary_is_inclusive() {
        let store = Arc::new(MemoryStore::new());
        let path = path_with(store, Arc::new(AllowAll));
        let principal = Principal::new("u1", "t1");

        // {"k":"<filler>"} serializes to exactly max_payload_bytes.
        let overhead = r#"{"k":""}"#.len();
        let filler = "x".repeat(65536 - overhead);
        let receipt = path
            .publish_event(Some(&principal), input(json!({ "k": filler })))
            .await
            .expect("exactly at cap");
        assert_eq!(receipt.seq, 1);

        let filler = "x".repeat(65536 - overhead + 1);
        assert!(matches!(
            path.publish_event(Some(&principal), input(json!({ "k": filler })))
                .await,
            Err(PlaneError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_store_write() {
        let store = Arc::new(MemoryStore::new());
        let path = path_with(store.clone(), Arc::new(AllowAll));
        let principal = Principal::new("u1", "t1");
        let mut bad_topic = input(json!({}));
        bad_topic.topic_id = "no spaces".to_string();
        assert!(matches!(
            path.publish_event(Some(&principal), bad_topic).await,
            Err(PlaneError::InvalidInput { field: "topicId", .. })
        ));
        let mut bad_type = input(json!({}));
        bad_type.event_type = "not-a-baseline".to_string();
        assert!(matches!(
            path.publish_event(Some(&principal), bad_type).await,
            Err(PlaneError::InvalidInput { field: "type", .. })
        ));
        let mut bad_priority = input(json!({}));
        bad_priority.priority = Some(11);
        assert!(matches!(
            path.publish_event(Some(&principal), bad_priority).await,
            Err(PlaneError::InvalidInput { field: "priority", .. })
        ));
        let bad_data = input(json!("not an object"));
        assert!(matches!(
            path.publish_event(Some(&principal), bad_data).await,
            Err(PlaneError::InvalidInput { field: "data", .. })
        ));
        // Nothing reached the topic stream.
        let len = store
            .stream_len("rt:stream:t1:doc:123")
            .await
            .expect("len");
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn input_flood_guard_trips_before_store_limits() {
        let store = Arc::new(MemoryStore::new());
        let path = path_with(store, Arc::new(AllowAll));
        let principal = Principal::new("u1", "t1");
        let mut admitted = 0;
        for n in 0..60 {
            if path
                .publish_event(Some(&principal), input(json!({ "n": n })))
                .await
                .is_ok()
            {
                admitted += 1;
            }
        }
        assert_eq!(admitted, INPUT_FREQUENCY_LIMIT as usize);
    }

    #[tokio::test]
    async fn sanitizer_rewrites_payload_strings() {
        let store = Arc::new(MemoryStore::new());
        let path = path_with(store.clone(), Arc::new(AllowAll));
        let principal = Principal::new("u1", "t1");
        path.publish_event(
            Some(&principal),
            input(json!({"note": "hi <script>x</script>there"})),
        )
        .await
        .expect("publish");
        let entries = store
            .stream_range_from("rt:stream:t1:doc:123", 0, 10)
            .await
            .expect("range");
        let data = entries[0].field("data").expect("data");
        assert!(!data.contains("script"));
        assert!(data.contains("hi there"));
    }
}
