use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use at_agents::ActivityEvent;
use at_bridge::event_bus::EventBus;
use at_bridge::protocol::{BridgeMessage, RecoveryPayload};
use at_core::config::RecoveryConfig;
use at_core::settings::ProjectSettings;
use at_core::task_store::{Subscription, TaskStore};
use at_core::types::StoreEvent;
use at_session::channel::{SendChannel, TerminalError};
use at_telemetry::metrics::{global_metrics, names};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::guard::FlagGuard;
use crate::recovery_prompt::{collect_interventions, compose, InterventionPolicy};

/// Which path invoked the decision procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The periodic fallback.
    Poll,
    /// The activity monitor reported the agent went idle.
    Idle,
    /// A task regressed from active to not started.
    Regression,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Poll => "poll",
            Trigger::Idle => "idle",
            Trigger::Regression => "regression",
        }
    }

    /// The idle signal already proves the turn finished.
    fn checks_busy(&self) -> bool {
        !matches!(self, Trigger::Idle)
    }
}

/// Result of one invocation of the decision procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Sent { message_id: Uuid, tasks: Vec<String> },
    NoDestination,
    InFlight,
    Busy,
    NothingToDo,
    Disabled,
    DestinationMissing,
    SendFailed(String),
    StoreUnavailable(String),
    /// Another invocation was already deciding.
    Coalesced,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Sent { .. } => "sent",
            RecoveryOutcome::NoDestination => "no_destination",
            RecoveryOutcome::InFlight => "in_flight",
            RecoveryOutcome::Busy => "busy",
            RecoveryOutcome::NothingToDo => "nothing_to_do",
            RecoveryOutcome::Disabled => "disabled",
            RecoveryOutcome::DestinationMissing => "destination_missing",
            RecoveryOutcome::SendFailed(_) => "send_failed",
            RecoveryOutcome::StoreUnavailable(_) => "store_unavailable",
            RecoveryOutcome::Coalesced => "coalesced",
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, RecoveryOutcome::Sent { .. })
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    message_id: Uuid,
    deadline: Instant,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    channel: Arc<dyn SendChannel>,
    settings: ProjectSettings,
    config: RecoveryConfig,
    bus: EventBus,
    destination: Mutex<Option<String>>,
    in_flight: Mutex<Option<InFlight>>,
    deciding: AtomicBool,
    /// An idle signal that found another decision running.
    idle_pending: AtomicBool,
}

/// Sends recovery messages into the agent's terminal, at most one outstanding
/// at a time.
///
/// A sent message holds an in-flight token until the agent is reported idle,
/// the send fails, or the token times out. Cloning shares the controller.
#[derive(Clone)]
pub struct RecoveryController {
    inner: Arc<Inner>,
}

impl RecoveryController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn SendChannel>,
        settings: ProjectSettings,
        config: RecoveryConfig,
    ) -> Self {
        Self::with_event_bus(store, channel, settings, config, EventBus::new())
    }

    pub fn with_event_bus(
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn SendChannel>,
        settings: ProjectSettings,
        config: RecoveryConfig,
        bus: EventBus,
    ) -> Self {
        let destination = config.destination.clone();
        Self {
            inner: Arc::new(Inner {
                store,
                channel,
                settings,
                config,
                bus,
                destination: Mutex::new(destination),
                in_flight: Mutex::new(None),
                deciding: AtomicBool::new(false),
                idle_pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn destination(&self) -> Option<String> {
        self.inner
            .destination
            .lock()
            .expect("recovery lock poisoned")
            .clone()
    }

    /// Select (or clear) the terminal that receives recovery messages.
    pub fn set_destination(&self, destination: Option<String>) {
        info!(destination = ?destination, "recovery destination changed");
        *self.inner.destination.lock().expect("recovery lock poisoned") = destination;
    }

    /// `true` while a sent message is awaiting confirmation. An expired
    /// token is cleared here.
    pub fn is_in_flight(&self) -> bool {
        let mut slot = self.inner.in_flight.lock().expect("recovery lock poisoned");
        match slot.as_ref() {
            Some(token) if Instant::now() >= token.deadline => {
                info!(message_id = %token.message_id, "recovery message unconfirmed, token expired");
                *slot = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Periodic fallback trigger.
    pub async fn poll(&self) -> RecoveryOutcome {
        self.run(Trigger::Poll).await
    }

    /// The agent went idle: the previous message has been handled, so the
    /// token is released and the decision runs without a busy check.
    pub async fn on_idle(&self) -> RecoveryOutcome {
        if let Some(token) = self.inner.in_flight.lock().expect("recovery lock poisoned").take() {
            debug!(message_id = %token.message_id, "idle signal confirmed recovery message");
        }
        self.run(Trigger::Idle).await
    }

    pub async fn on_regression(&self) -> RecoveryOutcome {
        self.run(Trigger::Regression).await
    }

    /// Route an activity monitor event. Only the idle event matters.
    pub async fn on_activity(&self, event: &ActivityEvent) -> Option<RecoveryOutcome> {
        match event {
            ActivityEvent::Idle => Some(self.on_idle().await),
            _ => None,
        }
    }

    /// Run the decision procedure out of band whenever a task regresses.
    pub fn observe_regressions(&self) -> Subscription {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.store.subscribe(Arc::new(move |event: &StoreEvent| {
            let StoreEvent::Transition(t) = event else {
                return;
            };
            if !t.is_regression() {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            debug!(task_id = %t.task_id, "regression, running recovery out of band");
            let controller = RecoveryController { inner };
            handle.spawn(async move {
                controller.on_regression().await;
            });
        }))
    }

    /// Run the decision procedure once and record the outcome.
    ///
    /// An idle signal that arrives while this call is deciding returns
    /// `Coalesced` and is handed to this call, which then runs the idle
    /// decision and returns its outcome instead.
    pub async fn run(&self, trigger: Trigger) -> RecoveryOutcome {
        let outcome = self.decide(trigger).await;
        self.record(trigger, &outcome);
        if outcome == RecoveryOutcome::Coalesced
            || !self.inner.idle_pending.swap(false, Ordering::SeqCst)
        {
            return outcome;
        }
        if outcome.is_sent() {
            // The deferred signal predates the message just sent.
            return outcome;
        }
        debug!(trigger = trigger.as_str(), "running deferred idle decision");
        let follow_up = self.decide(Trigger::Idle).await;
        self.record(Trigger::Idle, &follow_up);
        follow_up
    }

    fn record(&self, trigger: Trigger, outcome: &RecoveryOutcome) {
        global_metrics().increment_counter(names::RECOVERY_MESSAGES, &[("outcome", outcome.as_str())]);
        debug!(trigger = trigger.as_str(), outcome = outcome.as_str(), "recovery cycle finished");
    }

    async fn decide(&self, trigger: Trigger) -> RecoveryOutcome {
        if !self.inner.settings.failure_detection() {
            return RecoveryOutcome::Disabled;
        }
        let Some(destination) = self.destination() else {
            return RecoveryOutcome::NoDestination;
        };
        if self.is_in_flight() {
            return RecoveryOutcome::InFlight;
        }
        // Flag before trying the guard: either this call gets it or the
        // holder sees the flag once it lets go.
        if trigger == Trigger::Idle {
            self.inner.idle_pending.store(true, Ordering::SeqCst);
        }
        let Some(_guard) = FlagGuard::acquire(&self.inner.deciding) else {
            return RecoveryOutcome::Coalesced;
        };
        // A pending idle signal overrides the caller's trigger.
        let trigger = if self.inner.idle_pending.swap(false, Ordering::SeqCst) {
            Trigger::Idle
        } else {
            trigger
        };

        if trigger.checks_busy() {
            match self.inner.channel.is_busy(&destination).await {
                Ok(false) => {}
                Ok(true) => {
                    debug!(%destination, "agent busy, skipping recovery cycle");
                    return RecoveryOutcome::Busy;
                }
                Err(TerminalError::NotFound(_)) => return RecoveryOutcome::DestinationMissing,
                Err(e) => {
                    warn!(%destination, error = %e, "busy check failed, skipping recovery cycle");
                    return RecoveryOutcome::Busy;
                }
            }
        }

        let tasks = match self.inner.store.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to list tasks for recovery");
                return RecoveryOutcome::StoreUnavailable(e.to_string());
            }
        };
        let policy = InterventionPolicy {
            max_attempts: self.inner.config.max_attempts,
            stall_after: self.inner.config.stall_after(),
        };
        let interventions = collect_interventions(&tasks, &policy, Utc::now());
        if interventions.is_empty() {
            return RecoveryOutcome::NothingToDo;
        }

        // The awaits above may have raced an idle-path send.
        if self.is_in_flight() {
            return RecoveryOutcome::InFlight;
        }
        let message = compose(&interventions, &policy);
        let message_id = Uuid::new_v4();
        *self.inner.in_flight.lock().expect("recovery lock poisoned") = Some(InFlight {
            message_id,
            deadline: Instant::now() + self.inner.config.in_flight_timeout(),
        });

        let started = Instant::now();
        let sent = self.inner.channel.send(&destination, &message.text).await;
        global_metrics().record_histogram(names::RECOVERY_SEND_SECONDS, started.elapsed().as_secs_f64());

        if let Err(e) = sent {
            self.release_token(message_id);
            return match e {
                TerminalError::NotFound(_) => {
                    debug!(%destination, "recovery destination gone");
                    RecoveryOutcome::DestinationMissing
                }
                other => {
                    warn!(%destination, error = %other, "recovery message send failed");
                    RecoveryOutcome::SendFailed(other.to_string())
                }
            };
        }

        for id in &message.task_ids {
            if let Err(e) = self.inner.store.record_recovery_attempt(id).await {
                warn!(task_id = %id, error = %e, "failed to record recovery attempt");
            }
        }
        info!(
            %message_id,
            %destination,
            trigger = trigger.as_str(),
            tasks = message.task_ids.len(),
            "recovery message sent"
        );
        self.inner
            .bus
            .publish(BridgeMessage::RecoveryDispatched(RecoveryPayload {
                message_id,
                destination,
                task_ids: message.task_ids.clone(),
                timestamp: Utc::now(),
            }));
        RecoveryOutcome::Sent {
            message_id,
            tasks: message.task_ids,
        }
    }

    /// Clear the token only if it still belongs to `message_id`.
    fn release_token(&self, message_id: Uuid) {
        let mut slot = self.inner.in_flight.lock().expect("recovery lock poisoned");
        if slot.as_ref().is_some_and(|t| t.message_id == message_id) {
            *slot = None;
        }
    }
}

impl std::fmt::Debug for RecoveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryController")
            .field("destination", &self.destination())
            .field(
                "in_flight",
                &self.inner.in_flight.lock().expect("recovery lock poisoned").is_some(),
            )
            .finish()
    }
}
