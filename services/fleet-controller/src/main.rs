//! Fleet Controller
//!
//! Runs one controller process: registers this process as a Worker, takes
//! part in leader election, and while leading keeps Worker liveness and
//! Cluster assignments converged.
//!
//! Without an external store wired in, the process runs against the
//! in-memory store, which is only useful for local development.

use std::sync::Arc;

use anyhow::Result;
use fleet_controller::{Config, ControlLoop, MemoryStore, SystemClock};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        worker = %config.worker_name,
        lease = %config.lease_name,
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        heartbeat_ttl_secs = config.heartbeat_ttl.as_secs(),
        "Starting fleet controller"
    );

    let store = Arc::new(MemoryStore::new());
    warn!("Using in-memory store; state is not shared with other processes");

    let grace = config.shutdown_grace;
    let controller = ControlLoop::new(config, store.clone(), store, Arc::new(SystemClock));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel();
    let mut handle = tokio::spawn(controller.run(shutdown_rx, done_tx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut handle => {
            match result {
                Ok(Ok(())) => info!("Controller exited"),
                Ok(Err(e)) => error!(error = %e, "Controller error"),
                Err(e) => error!(error = %e, "Controller task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    // The controller waits up to the grace period for its own tasks.
    match tokio::time::timeout(grace * 2, done_rx).await {
        Ok(Ok(())) => info!("Fleet controller shutdown complete"),
        Ok(Err(_)) => warn!("Controller stopped without acknowledging shutdown"),
        Err(_) => warn!("Timed out waiting for controller shutdown"),
    }
    Ok(())
}
