//! Pinning Agent - node resource alignment daemon
//!
//! This binary runs as a DaemonSet on each Kubernetes node. It restores the
//! CPU and device assignments from its checkpoints, then serves pod
//! admission alongside health and metrics endpoints.

use anyhow::{Context, Result};
use pinning_lib::{
    checkpoint::FileCheckpointStore,
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    topology, NodeResourceManager,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pinning-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        state_dir = %config.state_dir.display(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    for name in components::ALL {
        health_registry.register(name).await;
    }

    let logger = StructuredLogger::new(&config.node_name);

    let cpu_topology = topology::discover(&config.sysfs_root)
        .await
        .context("Failed to discover CPU topology")?;
    let store = Arc::new(FileCheckpointStore::new(&config.state_dir));

    // Invalid restored state is fatal: exit non-zero rather than serve.
    let node = match NodeResourceManager::new(
        Arc::new(cpu_topology),
        config.node_resources(),
        store,
    ) {
        Ok(node) => Arc::new(node),
        Err(err) => {
            health_registry
                .set_unhealthy(err.component(), err.to_string())
                .await;
            error!(error = %err, "Failed to restore node resource state");
            return Err(err).context("Refusing to start with inconsistent state");
        }
    };
    node.log_startup(AGENT_VERSION);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), node));

    // Mark agent as ready once state is restored
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = api_handle => {
            let reason = match result {
                Ok(Ok(())) => "API server stopped".to_string(),
                Ok(Err(err)) => format!("API server failed: {err:#}"),
                Err(err) => format!("API server task failed: {err}"),
            };
            logger.log_shutdown(&reason);
            anyhow::bail!(reason);
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
        }
    }

    info!("Shutting down");
    Ok(())
}
