use std::sync::Arc;

use anyhow::{Context, Result};
use at_agents::{ActivityEvent, ActivityMonitor};
use at_bridge::event_bus::EventBus;
use at_bridge::protocol::BridgeMessage;
use at_core::config::Config;
use at_core::settings::ProjectSettings;
use at_core::task_store::{InMemoryTaskStore, JsonTaskStore, TaskStore};
use at_session::channel::SendChannel;
use at_session::tmux::TmuxChannel;
use at_telemetry::metrics::{global_metrics, names};
use tracing::{debug, info, warn};

use crate::recovery::RecoveryController;
use crate::scheduler::QueueScheduler;
use crate::shutdown::ShutdownSignal;

/// Wires the activity monitor, queue scheduler and recovery controller
/// around one task store and one event bus.
///
/// Monitor state changes are republished on the bus; the monitor's idle
/// event drives the recovery controller directly, and a poll interval covers
/// lost idle signals. Shuts down gracefully on the shutdown signal.
pub struct Daemon {
    config: Config,
    store: Arc<dyn TaskStore>,
    monitor: Arc<ActivityMonitor>,
    scheduler: QueueScheduler,
    recovery: RecoveryController,
    event_bus: EventBus,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build a daemon from configuration: a JSON task store when
    /// `queue.tasks_file` is set (in-memory otherwise) and a tmux channel.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let store: Arc<dyn TaskStore> = match &config.queue.tasks_file {
            Some(path) => Arc::new(
                JsonTaskStore::open(path.clone())
                    .await
                    .with_context(|| format!("failed to open task file {}", path.display()))?,
            ),
            None => Arc::new(InMemoryTaskStore::new()),
        };
        let channel: Arc<dyn SendChannel> = Arc::new(TmuxChannel::new());
        Ok(Self::with_parts(config, store, channel))
    }

    pub fn with_parts(config: Config, store: Arc<dyn TaskStore>, channel: Arc<dyn SendChannel>) -> Self {
        let event_bus = EventBus::new();
        let settings = ProjectSettings::from_config(&config.queue);
        let scheduler = QueueScheduler::with_event_bus(
            Arc::clone(&store),
            settings.clone(),
            &config.queue,
            event_bus.clone(),
        );
        let recovery = RecoveryController::with_event_bus(
            Arc::clone(&store),
            channel,
            settings,
            config.recovery.clone(),
            event_bus.clone(),
        );
        let monitor = ActivityMonitor::new(config.monitor.clone());

        Self {
            config,
            store,
            monitor,
            scheduler,
            recovery,
            event_bus,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<ActivityMonitor> {
        &self.monitor
    }

    pub fn scheduler(&self) -> &QueueScheduler {
        &self.scheduler
    }

    pub fn recovery(&self) -> &RecoveryController {
        &self.recovery
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&self) -> Result<()> {
        let _regressions = self.recovery.observe_regressions();

        if let Err(e) = self.monitor.start_watching() {
            warn!(error = %e, "activity monitor not watching, relying on recovery polling");
        }
        let forwarder = tokio::spawn(forward_activity(
            self.monitor.subscribe(),
            self.event_bus.clone(),
            self.recovery.clone(),
        ));

        let report = self.scheduler.process_queue().await;
        info!(
            promoted = report.promoted.len(),
            aborted = ?report.aborted,
            "initial promotion pass"
        );

        let mut poll = tokio::time::interval(self.config.recovery.poll_interval());
        // The first tick fires immediately; the idle path covers startup.
        poll.tick().await;

        info!(
            poll_secs = self.config.recovery.poll_interval_secs,
            max_parallel_tasks = self.config.queue.max_parallel_tasks,
            "daemon running"
        );
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let outcome = self.recovery.poll().await;
                    debug!(outcome = outcome.as_str(), "recovery poll");
                }
                _ = self.shutdown.wait() => {
                    info!("shutdown signal received, stopping");
                    break;
                }
            }
        }

        self.monitor.stop_watching();
        forwarder.abort();
        info!("daemon stopped");
        Ok(())
    }
}

/// Republish monitor state changes and hand idle events to recovery.
async fn forward_activity(
    events: flume::Receiver<ActivityEvent>,
    bus: EventBus,
    recovery: RecoveryController,
) {
    while let Ok(event) = events.recv_async().await {
        match event {
            ActivityEvent::StateChange(change) => {
                let to = change.to.to_string();
                global_metrics().increment_counter(names::ACTIVITY_STATE_CHANGES, &[("to", to.as_str())]);
                bus.publish(BridgeMessage::ActivityStateChanged {
                    from: change.from,
                    to: change.to,
                    timestamp: change.timestamp,
                });
            }
            ActivityEvent::Idle => {
                let outcome = recovery.on_idle().await;
                debug!(outcome = outcome.as_str(), "recovery after idle");
            }
            ActivityEvent::AtPrompt | ActivityEvent::Processing => {}
        }
    }
}
