// Gateway service main entry point.
use anyhow::{Context, Result};
use gateway::acl_source::PermissionSource;
use gateway::config::GatewayConfig;
use gateway::observability;
use relay_plane::{AccessSource, AllowAll, EventPlane};
use relay_store::RedisStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::from_env_or_yaml().context("load gateway config")?;
    let metrics_handle = observability::init_observability();

    let store = RedisStore::connect(&config.redis_url)
        .await
        .context("connect shared store")?;
    tracing::info!(redis = %config.redis_url, prefix = %config.plane.prefix, "store connected");

    // With auth disabled (non-production only) every principal the façade
    // fabricates gets full access; otherwise decisions come from the
    // principal's resolved permissions.
    let acl_source: Arc<dyn AccessSource> = if config.plane.allow_auth_disabled {
        Arc::new(AllowAll)
    } else {
        Arc::new(PermissionSource)
    };

    let plane = EventPlane::new(Arc::new(store), acl_source, config.plane.clone())
        .context("construct event plane")?;
    let background = plane.spawn_background();
    tracing::info!("event plane started");

    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));
    tracing::info!(addr = %config.metrics_bind, "metrics listener started");

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    background.shutdown();
    metrics_task.abort();
    tracing::info!("gateway stopped");
    Ok(())
}
