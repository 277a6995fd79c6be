//! kiln Fleet Daemon
//!
//! Runs the fleet controller: spawns and terminates build-executor VMs,
//! audits their health, reclaims the ones whose builders died, and retries
//! terminations that never confirmed.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kiln_fleetd::config::Config;
use kiln_fleetd::controller::FleetController;
use kiln_fleetd::events::NoopEventHandler;
use kiln_fleetd::process::ProcInspector;
use kiln_fleetd::provision::{MockChecker, MockSpawner, MockTerminator};
use kiln_store::MemoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kiln fleet daemon");

    let config = Config::from_env()?;
    info!(
        groups = config.groups.len(),
        cycle_interval_secs = config.thresholds.cycle_interval.as_secs(),
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wire the in-memory store and mock provisioning stack (the provider
    // backends plug in here)
    let store = Arc::new(MemoryStore::new());
    let spawner = Arc::new(MockSpawner::new());
    let terminator = Arc::new(MockTerminator::new(store.clone()));
    let checker = Arc::new(MockChecker::new(store.clone()));

    let controller = FleetController::new(
        store,
        spawner,
        terminator,
        checker,
        Arc::new(ProcInspector),
        Arc::new(NoopEventHandler),
        config,
    );

    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { controller.run(shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            match result {
                Ok(Ok(())) => info!("Fleet controller exited normally"),
                Ok(Err(e)) => error!(error = %e, "Fleet controller error"),
                Err(e) => error!(error = %e, "Fleet controller task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Give the controller and event handler time to shut down gracefully
    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Fleet daemon shutdown complete");
    Ok(())
}
