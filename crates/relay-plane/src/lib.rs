//! The relay event plane.
//!
//! # Purpose
//! Everything between the transport façade and the shared store: monotonic
//! sequencing and durable append per topic, cross-replica fan-out, bounded
//! per-subscriber queues with slow-client handling and coalescing,
//! admission control, presence, access-decision caching, and the replay
//! protocol.
//!
//! # How it fits
//! A transport resolves identity into a [`Principal`] and calls
//! [`EventPlane`]. The plane talks to the store through `relay-store` and
//! to same-replica subscribers through the in-process [`bus::BroadcastBus`];
//! other replicas see events via the store's pub/sub channel and their own
//! [`distributor::EventDistributor`].
//!
//! # Key invariants
//! - Per {tenant, topic}, assigned sequences are the store counter's
//!   linearization: dense, ascending, starting at 1.
//! - Delivery is at least once; consumers dedupe by `id` or `seq` across
//!   the replay/tail boundary.
//! - No replica-local state is authoritative; replicas are interchangeable.

pub mod acl;
pub mod bus;
pub mod distributor;
pub mod limiter;
pub mod presence;
pub mod publish;
pub mod subscription;
pub mod topic;
pub mod validate;

pub use acl::{AccessSource, AccessSourceError, AclCache, AllowAll, FailurePolicy};
pub use publish::{PublishInput, PublishReceipt};
pub use subscription::{SubscribeRequest, Subscription};
pub use topic::TopicStats;

use bus::{topic_channel, BroadcastBus};
use distributor::{EventDistributor, RecentIds};
use limiter::RateLimiter;
use presence::Presence;
use publish::PublishPath;
use relay_common::{
    EventEnvelope, EventType, PlaneConfig, PlaneError, PlaneResult, Principal,
};
use relay_store::{StoreApi, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use topic::TopicManager;
use uuid::Uuid;

const REAP_PERIOD: Duration = Duration::from_secs(30);
const HISTORY_DEFAULT: usize = 100;
const HISTORY_MAX: usize = 1000;

pub(crate) fn store_err(err: StoreError) -> PlaneError {
    match err {
        StoreError::Unavailable(_) | StoreError::Deadline => PlaneError::StoreUnavailable,
        StoreError::Protocol(message) => PlaneError::Internal(message),
    }
}

fn track<T>(result: PlaneResult<T>) -> PlaneResult<T> {
    if let Err(err) = &result {
        metrics::counter!("errors.total", "kind" => err.kind()).increment(1);
    }
    result
}

/// Background work owned by one replica: the distributor's pattern
/// subscription and the periodic reapers.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Abort all tasks; part of the replica shutdown sequence.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// One gateway replica's event plane. Construct once per process and share.
pub struct EventPlane {
    config: PlaneConfig,
    store: Arc<dyn StoreApi>,
    topics: Arc<TopicManager>,
    limiter: Arc<RateLimiter>,
    presence: Presence,
    acl: Arc<AclCache>,
    bus: Arc<BroadcastBus>,
    local_ids: Arc<RecentIds>,
    publisher: Arc<PublishPath>,
}

impl EventPlane {
    pub fn new(
        store: Arc<dyn StoreApi>,
        acl_source: Arc<dyn AccessSource>,
        config: PlaneConfig,
    ) -> PlaneResult<Self> {
        config
            .validate()
            .map_err(|err| PlaneError::Internal(err.to_string()))?;

        let acl = Arc::new(AclCache::new(
            store.clone(),
            acl_source,
            config.prefix.clone(),
            FailurePolicy::for_environment(config.environment),
            config.environment,
        )?);
        let topics = Arc::new(TopicManager::new(store.clone(), config.clone()));
        let limiter = Arc::new(RateLimiter::new(store.clone(), &config));
        let bus = Arc::new(BroadcastBus::default());
        let local_ids = Arc::new(RecentIds::new());
        let publisher = Arc::new(PublishPath::new(
            config.clone(),
            topics.clone(),
            limiter.clone(),
            acl.clone(),
            bus.clone(),
            local_ids.clone(),
        ));

        Ok(Self {
            presence: Presence::new(store.clone(), config.prefix.clone()),
            config,
            store,
            topics,
            limiter,
            acl,
            bus,
            local_ids,
            publisher,
        })
    }

    pub fn config(&self) -> &PlaneConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicManager {
        &self.topics
    }

    /// Spawn the distributor and the 30 s reaper for this replica.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let distributor = Arc::new(EventDistributor::new(
            self.store.clone(),
            self.topics.clone(),
            self.bus.clone(),
            self.local_ids.clone(),
            self.config.prefix.clone(),
        ));
        let distributor_handle = tokio::spawn(distributor.run());

        let topics = self.topics.clone();
        let limiter = self.limiter.clone();
        let publisher = self.publisher.clone();
        let reaper_handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAP_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match topics.reap_inactive().await {
                    Ok(reaped) if reaped > 0 => {
                        tracing::info!(reaped, "reaped inactive subscribers");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::debug!(error = %err, "reap pass failed"),
                }
                limiter.reap_fallback();
                publisher.reap_input_window();
            }
        });

        BackgroundTasks {
            handles: vec![distributor_handle, reaper_handle],
        }
    }

    pub async fn publish_event(
        &self,
        principal: Option<&Principal>,
        input: PublishInput,
    ) -> PlaneResult<PublishReceipt> {
        let start = Instant::now();
        let result = track(self.publisher.publish_event(principal, input).await);
        metrics::histogram!("publish.duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Open a subscriber stream: ACL, registration, optional replay from
    /// `from_seq` (when durability is enabled), then the live tail.
    pub async fn subscribe(
        &self,
        principal: Option<&Principal>,
        request: SubscribeRequest,
    ) -> PlaneResult<Subscription> {
        let start = Instant::now();
        let result = track(self.subscribe_inner(principal, request).await);
        metrics::histogram!("subscribe.setup_ms").record(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn subscribe_inner(
        &self,
        principal: Option<&Principal>,
        request: SubscribeRequest,
    ) -> PlaneResult<Subscription> {
        let principal = principal.ok_or(PlaneError::Unauthorized)?;
        validate::validate_topic_id(&request.topic_id)?;

        if !self.acl.check(principal, &request.topic_id).await? {
            return Err(PlaneError::AccessDenied {
                topic: request.topic_id,
            });
        }

        let sub_id = Uuid::new_v4().to_string();
        self.topics
            .add_subscriber(
                &principal.tenant_id,
                &request.topic_id,
                &sub_id,
                &principal.user_id,
            )
            .await?;

        let from_seq = request
            .from_seq
            .filter(|seq| *seq > 0 && self.config.durability_enabled);

        Ok(Subscription::spawn(
            self.topics.clone(),
            self.bus.clone(),
            principal.tenant_id.clone(),
            request.topic_id,
            sub_id,
            from_seq,
        ))
    }

    /// Explicit deregistration by subscriber id, for consumers that do not
    /// hold a [`Subscription`] handle. Idempotent with TTL expiry and the
    /// reaper.
    pub async fn unsubscribe(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
        subscriber_id: &str,
    ) -> PlaneResult<()> {
        let principal = self.presence_guard(principal, topic_id)?;
        track(
            self.topics
                .remove_subscriber(&principal.tenant_id, topic_id, subscriber_id)
                .await,
        )
    }

    pub async fn join(&self, principal: Option<&Principal>, topic_id: &str) -> PlaneResult<()> {
        let principal = self.presence_guard(principal, topic_id)?;
        track(
            self.presence
                .join(&principal.tenant_id, topic_id, &principal.user_id)
                .await,
        )?;
        self.announce_presence(principal, topic_id, "join").await;
        Ok(())
    }

    pub async fn leave(&self, principal: Option<&Principal>, topic_id: &str) -> PlaneResult<()> {
        let principal = self.presence_guard(principal, topic_id)?;
        track(
            self.presence
                .leave(&principal.tenant_id, topic_id, &principal.user_id)
                .await,
        )?;
        self.announce_presence(principal, topic_id, "leave").await;
        Ok(())
    }

    pub async fn heartbeat(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> PlaneResult<()> {
        let principal = self.presence_guard(principal, topic_id)?;
        track(
            self.presence
                .heartbeat(&principal.tenant_id, topic_id, &principal.user_id)
                .await,
        )
    }

    pub async fn presence_list(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> PlaneResult<Vec<String>> {
        let principal = self.presence_guard(principal, topic_id)?;
        track(self.presence.list(&principal.tenant_id, topic_id).await)
    }

    pub async fn topic_stats(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> PlaneResult<TopicStats> {
        track(self.stats_inner(principal, topic_id).await)
    }

    async fn stats_inner(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> PlaneResult<TopicStats> {
        let principal = principal.ok_or(PlaneError::Unauthorized)?;
        validate::validate_topic_id(topic_id)?;
        if !self.acl.check(principal, topic_id).await? {
            return Err(PlaneError::AccessDenied {
                topic: topic_id.to_string(),
            });
        }
        self.topics
            .topic_stats(&principal.tenant_id, topic_id)
            .await
    }

    /// Most recent entries of the durable tail, ascending by `seq`.
    pub async fn event_history(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
        count: Option<usize>,
    ) -> PlaneResult<Vec<EventEnvelope>> {
        track(self.history_inner(principal, topic_id, count).await)
    }

    async fn history_inner(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
        count: Option<usize>,
    ) -> PlaneResult<Vec<EventEnvelope>> {
        let principal = principal.ok_or(PlaneError::Unauthorized)?;
        validate::validate_topic_id(topic_id)?;
        if !self.acl.check(principal, topic_id).await? {
            return Err(PlaneError::AccessDenied {
                topic: topic_id.to_string(),
            });
        }
        let count = count.unwrap_or(HISTORY_DEFAULT).clamp(1, HISTORY_MAX);
        let mut entries = self
            .topics
            .read_from_seq(&principal.tenant_id, topic_id, 0, HISTORY_MAX)
            .await?;
        if entries.len() > count {
            entries.drain(..entries.len() - count);
        }
        Ok(entries)
    }

    fn presence_guard<'a>(
        &self,
        principal: Option<&'a Principal>,
        topic_id: &str,
    ) -> PlaneResult<&'a Principal> {
        let principal = principal.ok_or(PlaneError::Unauthorized)?;
        validate::validate_topic_id(topic_id)?;
        Ok(principal)
    }

    /// Best-effort in-band membership event so subscribers observe presence
    /// changes without polling. Never fails the presence operation itself.
    async fn announce_presence(&self, principal: &Principal, topic_id: &str, action: &str) {
        let data = match serde_json::value::to_raw_value(&serde_json::json!({
            "action": action,
            "userId": principal.user_id,
        })) {
            Ok(data) => data,
            Err(_) => return,
        };
        let mut envelope =
            EventEnvelope::seal(principal, topic_id, EventType::Presence, data, None);
        match self.topics.append(&mut envelope).await {
            Ok(()) => {
                self.local_ids.insert(envelope.id);
                self.bus.publish(
                    &topic_channel(&envelope.tenant_id, &envelope.topic_id),
                    envelope,
                );
            }
            Err(err) => {
                tracing::debug!(topic = topic_id, error = %err, "presence announce skipped");
            }
        }
    }
}
