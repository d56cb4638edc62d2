//! wxhub daemon
//!
//! Loads `wxhub.toml`, starts every configured station driver, replays each
//! driver's backlog into the sink and then follows it live until Ctrl+C.

mod drivers;
mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};

use wxhub_config::AppConfig;
use wxhub_sinks::FsSink;

use crate::scheduler::{replay_config, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    wxhub_obs::init("wxhubd");

    let config = AppConfig::load().context("failed to load configuration")?;
    let clock = config.station.clock()?;
    info!(
        drivers = config.drivers.len(),
        sink = %config.sink.dir.display(),
        "configuration loaded"
    );
    if config.drivers.is_empty() {
        info!("no drivers configured, nothing to do");
        return Ok(());
    }

    let sink = Arc::new(FsSink::new(&config.sink.dir)?);
    let registry = drivers::registry(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = Scheduler::new(
        sink,
        replay_config(&config.station, clock),
        config.station.last_update,
        config.daemon.serialize_backfill,
        shutdown_rx,
    );

    for (name, kind) in registry.drivers() {
        match registry.create(name) {
            Ok(driver) => scheduler.spawn(driver),
            Err(e) => error!(driver = %name, kind, error = %e, "failed to create driver"),
        }
    }
    info!(workers = scheduler.worker_count(), "daemon running, press Ctrl+C to stop");

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // keep the sender alive so workers are not told to stop
            error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    scheduler.join().await;
    info!("wxhub daemon stopped");
    Ok(())
}
