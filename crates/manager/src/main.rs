//! Fleet manager - control plane for plugin agents
//!
//! Accepts agent registrations and reports over HTTP, places plugin
//! instances on agents and keeps the fleet converged on the desired state.

use anyhow::{Context, Result};
use fleet_manager::{
    api,
    config::{Backend, ServiceConfig},
};
use manager_lib::{
    store::MemoryKvStore, FileDesiredState, GrpcAgentClient, HealthRegistry, Manager,
    RecordingCommander,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MANAGER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleet-manager");

    let config = ServiceConfig::load()?;
    info!(
        manager_id = %config.manager_id,
        backend = ?config.backend,
        dry_run = config.dry_run,
        "Manager configured"
    );

    let mut builder = Manager::builder()
        .config(config.manager_config())
        .health(HealthRegistry::new());

    if let Some(notice) = config.backend_notice() {
        warn!("{}", notice);
    }
    if config.backend == Backend::Kv {
        builder = builder.kv_store(Arc::new(MemoryKvStore::new()));
    }
    if config.dry_run {
        warn!("Dry run: commands are recorded, not sent to agents");
        builder = builder.commander(Arc::new(RecordingCommander::new()));
    } else {
        builder = builder.commander(Arc::new(GrpcAgentClient::new(
            config.agent_client_config(),
        )));
    }
    if let Some(path) = &config.desired_state_file {
        info!(path = %path, "Desired state read from file");
        builder = builder.desired_state(Arc::new(FileDesiredState::new(path)));
    }

    let manager = Arc::new(builder.build());
    manager
        .logger()
        .log_startup(MANAGER_VERSION, manager.backend_name());

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut handles = manager.start(&shutdown_tx).await;

    let app_state = Arc::new(api::AppState::new(manager.clone()));
    let listen_addr = config.listen_addr.clone();
    let api_shutdown = shutdown_tx.subscribe();
    let api_handle =
        tokio::spawn(async move { api::serve(&listen_addr, app_state, api_shutdown).await });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    manager.logger().log_shutdown("SIGINT received");
    info!("Shutting down");

    let _ = shutdown_tx.send(());
    for handle in handles.drain(..) {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server panicked"),
        Ok(Ok(())) => {}
    }

    Ok(())
}
