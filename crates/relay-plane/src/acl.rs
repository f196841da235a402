use async_trait::async_trait;
use relay_common::{keys, Environment, PlaneError, PlaneResult, Principal};
use relay_store::StoreApi;
use std::sync::Arc;
use std::time::Duration;

const DECISION_TTL: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum AccessSourceError {
    #[error("acl source unavailable: {0}")]
    Unavailable(String),
}

/// External source of topic access decisions. The document store behind it
/// is outside the event plane; we only see this seam.
#[async_trait]
pub trait AccessSource: Send + Sync {
    async fn check_topic_access(
        &self,
        principal: &Principal,
        topic: &str,
    ) -> Result<bool, AccessSourceError>;
}

/// Allows every request. Only for development and tests.
pub struct AllowAll;

#[async_trait]
impl AccessSource for AllowAll {
    async fn check_topic_access(
        &self,
        _principal: &Principal,
        _topic: &str,
    ) -> Result<bool, AccessSourceError> {
        Ok(true)
    }
}

/// What to do when the external source cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    FailOpen,
    FailClosed,
}

impl FailurePolicy {
    pub fn for_environment(environment: Environment) -> Self {
        if environment.is_production() {
            Self::FailClosed
        } else {
            Self::FailOpen
        }
    }
}

/// Short-TTL cache of access decisions in front of the external source.
/// Decisions are cached in the shared store so all replicas converge on one
/// answer per {topic, user} within the TTL.
pub struct AclCache {
    store: Arc<dyn StoreApi>,
    source: Arc<dyn AccessSource>,
    prefix: String,
    policy: FailurePolicy,
}

impl std::fmt::Debug for AclCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclCache")
            .field("prefix", &self.prefix)
            .field("policy", &self.policy)
            .finish()
    }
}

impl AclCache {
    /// Fail-open in production is a configuration defect, rejected here
    /// rather than discovered during an outage.
    pub fn new(
        store: Arc<dyn StoreApi>,
        source: Arc<dyn AccessSource>,
        prefix: impl Into<String>,
        policy: FailurePolicy,
        environment: Environment,
    ) -> PlaneResult<Self> {
        if environment.is_production() && policy == FailurePolicy::FailOpen {
            return Err(PlaneError::Internal(
                "acl fail-open policy is not permitted in production".to_string(),
            ));
        }
        Ok(Self {
            store,
            source,
            prefix: prefix.into(),
            policy,
        })
    }

    pub async fn check(&self, principal: &Principal, topic: &str) -> PlaneResult<bool> {
        let key = keys::acl(&self.prefix, topic, &principal.user_id);

        // Cache lookup is best effort: a dead store must not take the ACL
        // source down with it.
        match self.store.get(&key).await {
            Ok(Some(cached)) => return Ok(cached == "1"),
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(key, error = %err, "acl cache read failed");
            }
        }

        match self.source.check_topic_access(principal, topic).await {
            Ok(allowed) => {
                let value = if allowed { "1" } else { "0" };
                if let Err(err) = self.store.set_with_ttl(&key, value, DECISION_TTL).await {
                    tracing::debug!(key, error = %err, "acl cache write failed");
                }
                Ok(allowed)
            }
            Err(err) => {
                let allowed = self.policy == FailurePolicy::FailOpen;
                tracing::warn!(
                    topic,
                    user = %principal.user_id,
                    error = %err,
                    allowed,
                    "acl source unavailable, applying failure policy"
                );
                Ok(allowed)
            }
        }
    }
}
