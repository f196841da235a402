use chrono::Utc;
use crate::store_err;
use relay_common::{keys, PlaneResult};
use relay_store::StoreApi;
use std::sync::Arc;
use std::time::Duration;

// Whole-hash TTL, refreshed by any write. Members that stop heartbeating
// disappear with the hash rather than one by one.
const PRESENCE_TTL: Duration = Duration::from_secs(30);

/// TTL-refreshed membership per {tenant, topic}. Presence never
/// back-pressures publishes and plays no part in durability; every
/// operation is idempotent.
pub struct Presence {
    store: Arc<dyn StoreApi>,
    prefix: String,
}

impl Presence {
    pub fn new(store: Arc<dyn StoreApi>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub async fn join(&self, tenant: &str, topic: &str, user: &str) -> PlaneResult<()> {
        self.touch(tenant, topic, user).await
    }

    pub async fn heartbeat(&self, tenant: &str, topic: &str, user: &str) -> PlaneResult<()> {
        self.touch(tenant, topic, user).await
    }

    pub async fn leave(&self, tenant: &str, topic: &str, user: &str) -> PlaneResult<()> {
        let key = keys::presence(&self.prefix, tenant, topic);
        self.store
            .hash_del(&key, user)
            .await
            .map_err(store_err)
    }

    pub async fn list(&self, tenant: &str, topic: &str) -> PlaneResult<Vec<String>> {
        let key = keys::presence(&self.prefix, tenant, topic);
        let mut members = self
            .store
            .hash_keys(&key)
            .await
            .map_err(store_err)?;
        members.sort_unstable();
        Ok(members)
    }

    async fn touch(&self, tenant: &str, topic: &str, user: &str) -> PlaneResult<()> {
        let key = keys::presence(&self.prefix, tenant, topic);
        let now_ms = Utc::now().timestamp_millis().to_string();
        self.store
            .hash_set(&key, &[(user, now_ms)])
            .await
            .map_err(store_err)?;
        self.store
            .expire(&key, PRESENCE_TTL)
            .await
            .map_err(store_err)
    }
}
