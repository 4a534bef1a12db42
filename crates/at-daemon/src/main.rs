//! auto-claude daemon: watches the agent's transcripts, promotes queued
//! tasks and sends recovery messages until ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use at_core::config::Config;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => Config::load_from(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    at_telemetry::logging::init(
        "at-daemon",
        &config.general.log_level,
        config.general.log_json,
    );
    info!(
        project = %config.general.project_name,
        version = env!("CARGO_PKG_VERSION"),
        "auto-claude daemon starting"
    );

    let daemon = at_daemon::daemon::Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
