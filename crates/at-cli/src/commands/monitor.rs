use std::path::PathBuf;

use anyhow::{Context, Result};
use at_agents::{ActivityEvent, ActivityMonitor};
use at_bridge::protocol::BridgeMessage;
use at_core::config::MonitorConfig;

/// Watch the transcript root and print state changes until ctrl-c.
pub async fn run(mut config: MonitorConfig, root: Option<PathBuf>, json_output: bool) -> Result<()> {
    if let Some(root) = root {
        config.transcripts_root = root;
    }
    config.validate().context("invalid monitor configuration")?;
    let root = config.transcripts_root.clone();

    let monitor = ActivityMonitor::new(config);
    let events = monitor.subscribe();
    monitor
        .start_watching()
        .with_context(|| format!("cannot watch {}", root.display()))?;

    let initial = monitor.check_state().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "initial check failed");
        monitor.get_current_state()
    });
    if !json_output {
        println!("watching {} (state {initial}), ctrl-c to stop", root.display());
    }

    loop {
        tokio::select! {
            event = events.recv_async() => {
                let change = match event {
                    Ok(ActivityEvent::StateChange(change)) => change,
                    Ok(_) => continue,
                    Err(_) => break,
                };
                if json_output {
                    let msg = BridgeMessage::ActivityStateChanged {
                        from: change.from,
                        to: change.to,
                        timestamp: change.timestamp,
                    };
                    println!("{}", serde_json::to_string(&msg)?);
                } else {
                    println!(
                        "{}  {} -> {}",
                        change.timestamp.format("%H:%M:%S"),
                        change.from,
                        change.to
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.stop_watching();
    Ok(())
}
