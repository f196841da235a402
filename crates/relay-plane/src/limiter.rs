use relay_common::{keys, PlaneConfig, PlaneError, PlaneResult};
use relay_store::StoreApi;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const TOPIC_WINDOW: Duration = Duration::from_secs(60);
const TOPIC_LIMIT: u32 = 1000;
const GLOBAL_WINDOW: Duration = Duration::from_secs(60);
const GLOBAL_LIMIT: u32 = 10_000;
// Fallback admits a tenth of the configured budget while coordination is
// lost; dropping publishes beats unbounded admission.
const FALLBACK_DIVISOR: u32 = 10;
const FALLBACK_REAP_AGE: Duration = Duration::from_secs(300);

#[derive(Default)]
struct Window {
    hits: Vec<Instant>,
}

/// Replica-local sliding window over wall-clock hits. Shared by the
/// limiter's store-loss fallback and the publish path's input-frequency
/// guard; never authoritative across replicas.
pub struct SlidingWindowMap {
    inner: Mutex<HashMap<String, Window>>,
}

impl Default for SlidingWindowMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or deny one hit for `key`. On deny, returns seconds until the
    /// oldest in-window hit ages out.
    pub fn check(&self, key: &str, window: Duration, limit: u32) -> Result<(), u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("window lock");
        let slot = inner.entry(key.to_string()).or_default();
        slot.hits.retain(|hit| now.duration_since(*hit) < window);
        if (slot.hits.len() as u32) < limit {
            slot.hits.push(now);
            Ok(())
        } else {
            let reset = slot
                .hits
                .first()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            Err(reset.as_secs().max(1))
        }
    }

    /// Drop entries whose window reset is long past.
    pub fn reap(&self, window: Duration) {
        let now = Instant::now();
        let horizon = window + FALLBACK_REAP_AGE;
        self.inner
            .lock()
            .expect("window lock")
            .retain(|_, slot| {
                slot.hits
                    .last()
                    .is_some_and(|newest| now.duration_since(*newest) < horizon)
            });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("window lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sliding-window admission control. The store executes the window
/// atomically on its own clock; when the store is unreachable the limiter
/// fails closed onto an in-process window at a tenth of the budget.
pub struct RateLimiter {
    store: std::sync::Arc<dyn StoreApi>,
    user_window: Duration,
    user_limit: u32,
    fallback: SlidingWindowMap,
}

impl RateLimiter {
    pub fn new(store: std::sync::Arc<dyn StoreApi>, config: &PlaneConfig) -> Self {
        Self {
            store,
            user_window: Duration::from_millis(config.rate_window_ms),
            user_limit: config.rate_max_requests,
            fallback: SlidingWindowMap::new(),
        }
    }

    pub async fn check_user_action(&self, user: &str, action: &str) -> PlaneResult<()> {
        let key = keys::user_action_rate(user, action);
        self.check(&key, self.user_window, self.user_limit).await
    }

    pub async fn check_topic(&self, prefix: &str, tenant: &str, topic: &str) -> PlaneResult<()> {
        let key = keys::topic_rate(prefix, tenant, topic);
        self.check(&key, TOPIC_WINDOW, TOPIC_LIMIT).await
    }

    pub async fn check_global(&self) -> PlaneResult<()> {
        self.check(&keys::global_rate(), GLOBAL_WINDOW, GLOBAL_LIMIT)
            .await
    }

    async fn check(&self, key: &str, window: Duration, limit: u32) -> PlaneResult<()> {
        match self.store.rate_limit(key, window, limit).await {
            Ok(decision) if decision.allowed => {
                metrics::counter!("rateLimits.hits").increment(1);
                Ok(())
            }
            Ok(decision) => {
                metrics::counter!("rateLimits.blocks").increment(1);
                Err(PlaneError::RateLimited {
                    reset_after_secs: decision.reset_after_secs,
                })
            }
            Err(err) if err.transient() => {
                tracing::warn!(key, error = %err, "rate limit store check failed, using fallback");
                self.fallback_check(key, window, limit)
            }
            Err(err) => {
                tracing::error!(key, error = %err, "rate limit store check failed hard");
                Err(PlaneError::StoreUnavailable)
            }
        }
    }

    fn fallback_check(&self, key: &str, window: Duration, limit: u32) -> PlaneResult<()> {
        let reduced = limit / FALLBACK_DIVISOR;
        match self.fallback.check(key, window, reduced) {
            Ok(()) => {
                metrics::counter!("rateLimits.hits").increment(1);
                Ok(())
            }
            Err(reset_after_secs) => {
                metrics::counter!("rateLimits.blocks").increment(1);
                Err(PlaneError::RateLimited { reset_after_secs })
            }
        }
    }

    /// Periodic cleanup of the fallback map.
    pub fn reap_fallback(&self) {
        self.fallback.reap(self.user_window.max(TOPIC_WINDOW));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::MemoryStore;
    use std::sync::Arc;

    fn limiter(store: Arc<MemoryStore>) -> RateLimiter {
        RateLimiter::new(store, &PlaneConfig::default())
    }

    #[tokio::test]
    async fn user_action_allows_within_budget() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store);
        for _ in 0..10 {
            limiter
                .check_user_action("u1", "publish")
                .await
                .expect("allowed");
        }
    }

    #[tokio::test]
    async fn user_action_denies_over_budget_with_reset() {
        let store = Arc::new(MemoryStore::new());
        let config = PlaneConfig {
            rate_max_requests: 3,
            ..PlaneConfig::default()
        };
        let limiter = RateLimiter::new(store, &config);
        for _ in 0..3 {
            limiter
                .check_user_action("u1", "publish")
                .await
                .expect("allowed");
        }
        match limiter.check_user_action("u1", "publish").await {
            Err(PlaneError::RateLimited { reset_after_secs }) => {
                assert!(reset_after_secs <= 60);
            }
            other => panic!("expected rate limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_loss_fails_closed_at_a_tenth() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let limiter = limiter(store);
        let mut admitted = 0;
        for _ in 0..20 {
            if limiter.check_user_action("u1", "publish").await.is_ok() {
                admitted += 1;
            }
        }
        // Configured limit 100, fallback admits 100/10.
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn fallback_is_per_key() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let limiter = limiter(store);
        for _ in 0..10 {
            limiter
                .check_user_action("u1", "publish")
                .await
                .expect("u1 budget");
        }
        assert!(limiter.check_user_action("u1", "publish").await.is_err());
        limiter
            .check_user_action("u2", "publish")
            .await
            .expect("u2 has its own window");
    }

    #[tokio::test]
    async fn recovery_returns_to_full_budget() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), &PlaneConfig::default());
        store.set_available(false);
        while limiter.check_user_action("u1", "publish").await.is_ok() {}
        store.set_available(true);
        limiter
            .check_user_action("u1", "publish")
            .await
            .expect("store window is fresh");
    }

    #[test]
    fn window_map_reap_keeps_in_horizon_entries() {
        let map = SlidingWindowMap::new();
        map.check("k", Duration::from_secs(60), 5).expect("hit");
        map.reap(Duration::from_secs(60));
        assert_eq!(map.len(), 1);
        assert!(!map.is_empty());
    }

    #[test]
    fn window_map_denies_at_limit() {
        let map = SlidingWindowMap::new();
        let window = Duration::from_secs(60);
        assert!(map.check("k", window, 2).is_ok());
        assert!(map.check("k", window, 2).is_ok());
        let reset = map.check("k", window, 2).expect_err("full");
        assert!(reset >= 1 && reset <= 60);
    }
}
