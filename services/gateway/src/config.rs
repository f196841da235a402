use anyhow::{Context, Result};
use relay_common::{Environment, PlaneConfig};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

// Gateway configuration sourced from environment variables, with optional
// YAML overrides for ops-managed deployments.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub plane: PlaneConfig,
    // Shared store URL; all replicas must point at the same store.
    pub redis_url: String,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
}

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9100";

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    prefix: Option<String>,
    max_topic_buffer: Option<usize>,
    max_subscriber_queue: Option<usize>,
    slow_client_threshold_ms: Option<u64>,
    durability_enabled: Option<bool>,
    max_payload_bytes: Option<usize>,
    rate_window_ms: Option<u64>,
    rate_max_requests: Option<u32>,
    allow_auth_disabled: Option<bool>,
    environment: Option<String>,
    redis_url: Option<String>,
    metrics_bind: Option<String>,
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "TRUE" | "YES"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = PlaneConfig::default();
        let plane = PlaneConfig {
            prefix: std::env::var("RELAY_PREFIX").unwrap_or(defaults.prefix),
            max_topic_buffer: env_parse("RELAY_MAX_TOPIC_BUFFER")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_topic_buffer),
            max_subscriber_queue: env_parse("RELAY_MAX_SUB_QUEUE")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_subscriber_queue),
            slow_client_threshold_ms: env_parse("RELAY_SLOW_CLIENT_MS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.slow_client_threshold_ms),
            durability_enabled: env_bool("RELAY_DURABILITY")
                .unwrap_or(defaults.durability_enabled),
            max_payload_bytes: env_parse("RELAY_MAX_PAYLOAD_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_payload_bytes),
            rate_window_ms: env_parse("RELAY_RATE_WINDOW_MS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.rate_window_ms),
            rate_max_requests: env_parse("RELAY_RATE_MAX_REQUESTS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.rate_max_requests),
            environment: Environment::from_name(
                &std::env::var("RELAY_ENV").unwrap_or_default(),
            ),
            allow_auth_disabled: env_bool("RELAY_ALLOW_AUTH_DISABLED")
                .unwrap_or(defaults.allow_auth_disabled),
        };
        let metrics_bind = std::env::var("RELAY_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse RELAY_METRICS_BIND")?;
        Ok(Self {
            plane,
            redis_url: std::env::var("RELAY_REDIS_URL")
                .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            metrics_bind,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = std::env::var("RELAY_CONFIG").ok().filter(|p| !p.is_empty()) {
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(err).with_context(|| format!("read RELAY_CONFIG: {path}"));
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("read RELAY_CONFIG: {path}"));
                }
            };
            config.apply_yaml(&contents)?;
        }
        // Startup is the last safe moment to catch a production deploy with
        // auth disabled or a malformed namespace.
        config
            .plane
            .validate()
            .context("invalid gateway configuration")?;
        Ok(config)
    }

    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let overrides: GatewayConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse gateway config yaml")?;
        if let Some(value) = overrides.prefix {
            self.plane.prefix = value;
        }
        if let Some(value) = overrides.max_topic_buffer
            && value > 0
        {
            self.plane.max_topic_buffer = value;
        }
        if let Some(value) = overrides.max_subscriber_queue
            && value > 0
        {
            self.plane.max_subscriber_queue = value;
        }
        if let Some(value) = overrides.slow_client_threshold_ms
            && value > 0
        {
            self.plane.slow_client_threshold_ms = value;
        }
        if let Some(value) = overrides.durability_enabled {
            self.plane.durability_enabled = value;
        }
        if let Some(value) = overrides.max_payload_bytes
            && value > 0
        {
            self.plane.max_payload_bytes = value;
        }
        if let Some(value) = overrides.rate_window_ms
            && value > 0
        {
            self.plane.rate_window_ms = value;
        }
        if let Some(value) = overrides.rate_max_requests
            && value > 0
        {
            self.plane.rate_max_requests = value;
        }
        if let Some(value) = overrides.allow_auth_disabled {
            self.plane.allow_auth_disabled = value;
        }
        if let Some(value) = overrides.environment {
            self.plane.environment = Environment::from_name(&value);
        }
        if let Some(value) = overrides.redis_url {
            self.redis_url = value;
        }
        if let Some(value) = overrides.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GatewayConfig {
        GatewayConfig {
            plane: PlaneConfig::default(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            metrics_bind: DEFAULT_METRICS_BIND.parse().expect("bind"),
        }
    }

    #[test]
    fn yaml_overrides_take_effect() {
        let mut config = base();
        config
            .apply_yaml(
                "prefix: gw\nmax_subscriber_queue: 250\ndurability_enabled: true\nredis_url: redis://store:6379\n",
            )
            .expect("apply");
        assert_eq!(config.plane.prefix, "gw");
        assert_eq!(config.plane.max_subscriber_queue, 250);
        assert!(config.plane.durability_enabled);
        assert_eq!(config.redis_url, "redis://store:6379");
    }

    #[test]
    fn zero_valued_overrides_are_ignored() {
        let mut config = base();
        config
            .apply_yaml("max_subscriber_queue: 0\nmax_topic_buffer: 0\n")
            .expect("apply");
        assert_eq!(config.plane.max_subscriber_queue, 100);
        assert_eq!(config.plane.max_topic_buffer, 1000);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut config = base();
        assert!(config.apply_yaml("max_subscriber_queue: [not a number]").is_err());
    }

    #[test]
    fn production_with_auth_disabled_fails_validation() {
        let mut config = base();
        config
            .apply_yaml("environment: production\nallow_auth_disabled: true\n")
            .expect("apply");
        assert!(config.plane.validate().is_err());
    }

    #[test]
    fn production_with_auth_enabled_validates() {
        let mut config = base();
        config
            .apply_yaml("environment: production\n")
            .expect("apply");
        config.plane.validate().expect("valid");
    }
}
