use serde::{Deserialize, Serialize};

/// Deploy environment. Anything that is not literally "production" is
/// treated as non-production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("production") {
            Self::Production
        } else {
            Self::Development
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

/// Tunables recognized by the event plane. Defaults are conservative and
/// match the cross-replica contract: changing `prefix` or the queue caps on
/// one replica only is a deployment error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneConfig {
    /// Key namespace shared by all replicas on one store.
    pub prefix: String,
    /// Durable stream cap per topic (approximate trim target).
    pub max_topic_buffer: usize,
    /// Per-subscriber bounded queue cap.
    pub max_subscriber_queue: usize,
    /// Subscribers idle longer than this are reaped.
    pub slow_client_threshold_ms: u64,
    /// Gates the `from_seq` replay path.
    pub durability_enabled: bool,
    /// Serialized payload cap in bytes.
    pub max_payload_bytes: usize,
    /// Sliding window for the per-principal action limiter.
    pub rate_window_ms: u64,
    /// Request budget per window for the per-principal action limiter.
    pub rate_max_requests: u32,
    pub environment: Environment,
    /// Test-only escape hatch; must never survive into production.
    pub allow_auth_disabled: bool,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            prefix: "rt".to_string(),
            max_topic_buffer: 1000,
            max_subscriber_queue: 100,
            slow_client_threshold_ms: 5000,
            durability_enabled: false,
            max_payload_bytes: 65536,
            rate_window_ms: 60_000,
            rate_max_requests: 100,
            environment: Environment::Development,
            allow_auth_disabled: false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Invalid(String),
}

impl PlaneConfig {
    /// Startup validation. Fails rather than degrades: a production deploy
    /// with auth disabled admits every caller, so we refuse to boot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.is_production() && self.allow_auth_disabled {
            return Err(ConfigError::Invalid(
                "allow_auth_disabled is not permitted in production".to_string(),
            ));
        }
        if self.prefix.is_empty() || self.prefix.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "prefix must be a single non-empty key segment, got {:?}",
                self.prefix
            )));
        }
        if self.max_subscriber_queue == 0 {
            return Err(ConfigError::Invalid(
                "max_subscriber_queue must be at least 1".to_string(),
            ));
        }
        if self.max_topic_buffer == 0 {
            return Err(ConfigError::Invalid(
                "max_topic_buffer must be at least 1".to_string(),
            ));
        }
        if self.rate_window_ms == 0 || self.rate_max_requests == 0 {
            return Err(ConfigError::Invalid(
                "rate limit window and budget must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
