//! Live activity monitor for the externally running agent session.
//!
//! Watches the transcript root, debounces bursts of writes, and runs one
//! classification pass at a time. While the agent is `PROCESSING` a recheck
//! timer keeps polling, since a session that stops writing produces no
//! filesystem events to wake the monitor.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use at_bridge::event_bus::EventBus;
use at_core::config::MonitorConfig;
use at_core::file_watcher::{FileChangeKind, FileWatcher, FileWatcherConfig};
use at_core::types::ActivityState;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classifier::{classify, Thresholds};
use crate::locator::{LatestTranscript, TranscriptLocator};
use crate::transcript;

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ActivityState,
    pub to: ActivityState,
    pub timestamp: DateTime<Utc>,
}

/// Published on every state change: first the generic
/// [`StateChange`](ActivityEvent::StateChange), then the variant named after
/// the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    StateChange(StateChange),
    AtPrompt,
    Processing,
    Idle,
}

impl ActivityEvent {
    fn for_state(state: ActivityState) -> Self {
        match state {
            ActivityState::AtPrompt => ActivityEvent::AtPrompt,
            ActivityState::Processing => ActivityEvent::Processing,
            ActivityState::Idle => ActivityEvent::Idle,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("transcript io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot watch {path}: {reason}")]
    Watch { path: PathBuf, reason: String },
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Resets the in-progress flag when the pass ends, including when the pass
/// future is dropped mid-await.
struct CheckGuard<'a>(&'a AtomicBool);

impl<'a> CheckGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A single-shot timer slot. Arming replaces (and aborts) whatever was armed
/// before; the generation lets a fired task tell whether it was superseded.
#[derive(Default)]
struct Timer {
    slot: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

impl Timer {
    fn arm<F, Fut>(&self, task: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock().expect("timer lock poisoned");
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(tokio::spawn(task(generation)));
    }

    fn cancel(&self) {
        let mut slot = self.slot.lock().expect("timer lock poisoned");
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Called by the fired task. Detaches its own handle so that a later
    /// `cancel` cannot abort the pass it is about to run.
    fn claim(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock().expect("timer lock poisoned");
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        slot.take();
        true
    }

    fn is_armed(&self) -> bool {
        let slot = self.slot.lock().expect("timer lock poisoned");
        slot.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct MonitorState {
    current: ActivityState,
    changed_at: Instant,
    last_seen: Option<(PathBuf, SystemTime)>,
}

enum Evaluation {
    State(ActivityState),
    Unchanged,
}

// ---------------------------------------------------------------------------
// ActivityMonitor
// ---------------------------------------------------------------------------

/// Infers whether the agent is at its prompt, processing, or idle.
///
/// Always handled through an `Arc`: timers and the watcher pump hold weak
/// references back to the monitor.
pub struct ActivityMonitor {
    config: MonitorConfig,
    thresholds: Thresholds,
    locator: TranscriptLocator,
    events: EventBus<ActivityEvent>,
    checking: AtomicBool,
    /// Classification passes started so far.
    passes: AtomicU64,
    watching: AtomicBool,
    state: Mutex<MonitorState>,
    pump: Mutex<Option<JoinHandle<()>>>,
    debounce: Timer,
    recheck: Timer,
}

impl ActivityMonitor {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        let locator = TranscriptLocator::new(
            config.transcripts_root.clone(),
            config.recency_window(),
            config.latest_file_ttl(),
        );
        Arc::new(Self {
            thresholds: Thresholds::from_config(&config),
            locator,
            events: EventBus::new(),
            checking: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            watching: AtomicBool::new(false),
            state: Mutex::new(MonitorState {
                current: ActivityState::Idle,
                changed_at: Instant::now(),
                last_seen: None,
            }),
            pump: Mutex::new(None),
            debounce: Timer::default(),
            recheck: Timer::default(),
            config,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> flume::Receiver<ActivityEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus<ActivityEvent> {
        &self.events
    }

    pub fn get_current_state(&self) -> ActivityState {
        self.state.lock().expect("monitor state lock poisoned").current
    }

    pub fn get_time_since_state_change(&self) -> Duration {
        self.state
            .lock()
            .expect("monitor state lock poisoned")
            .changed_at
            .elapsed()
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Whether a recheck timer is currently pending.
    pub fn recheck_pending(&self) -> bool {
        self.recheck.is_armed()
    }

    /// Start watching the transcript root. Idempotent.
    ///
    /// Fails when the root cannot be read or watched; the monitor then keeps
    /// working for explicit [`check_state`](Self::check_state) calls only.
    pub fn start_watching(self: &Arc<Self>) -> Result<(), MonitorError> {
        if self.watching.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let root = self.config.transcripts_root.clone();
        let mut watcher = match FileWatcher::start(FileWatcherConfig::transcripts(&root)) {
            Ok(w) => w,
            Err(e) => {
                self.watching.store(false, Ordering::SeqCst);
                warn!(root = %root.display(), error = %e, "transcript watching not started");
                return Err(MonitorError::Watch {
                    path: root,
                    reason: e.to_string(),
                });
            }
        };

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(batch) = watcher.next_events().await {
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                for event in &batch {
                    match event.kind {
                        FileChangeKind::Deleted => monitor.locator.forget(&event.path),
                        _ if event.path.exists() => monitor.locator.prefer(&event.path),
                        _ => monitor.locator.forget(&event.path),
                    }
                }
                debug!(events = batch.len(), "transcript change");
                monitor.schedule_check();
            }
        });
        *self.pump.lock().expect("pump lock poisoned") = Some(handle);

        info!(root = %root.display(), "activity monitor watching transcripts");
        self.schedule_check();
        Ok(())
    }

    /// Stop watching and cancel pending timers. Idempotent.
    pub fn stop_watching(&self) {
        if let Some(pump) = self.pump.lock().expect("pump lock poisoned").take() {
            pump.abort();
        }
        self.debounce.cancel();
        self.recheck.cancel();
        if self.watching.swap(false, Ordering::SeqCst) {
            info!("activity monitor stopped");
        }
    }

    /// Run a classification pass now and return the resulting state.
    ///
    /// If a pass is already running this returns the current state without
    /// starting another one.
    pub async fn check_state(self: &Arc<Self>) -> Result<ActivityState, MonitorError> {
        let Some(_guard) = CheckGuard::acquire(&self.checking) else {
            debug!("classification pass already running");
            return Ok(self.get_current_state());
        };
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(pass, "classification pass");

        let outcome = self.evaluate().await;
        if let Ok(Evaluation::State(state)) = outcome {
            self.set_state(state);
        }

        self.recheck.cancel();
        if self.get_current_state() == ActivityState::Processing {
            self.arm_recheck();
        }

        outcome.map(|_| self.get_current_state())
    }

    /// Fresh pass; `true` only if the agent is at its prompt. Any error
    /// reads as "not at prompt".
    pub async fn is_at_prompt(self: &Arc<Self>) -> bool {
        match self.check_state().await {
            Ok(state) => state == ActivityState::AtPrompt,
            Err(e) => {
                warn!(error = %e, "activity check failed");
                false
            }
        }
    }

    async fn evaluate(&self) -> Result<Evaluation, MonitorError> {
        let Some(latest) = self.locator.latest().await? else {
            debug!("no recent transcript");
            return Ok(Evaluation::State(ActivityState::Idle));
        };

        let file_age = latest.age(SystemTime::now());
        let new_write = self.note_write(&latest);
        if file_age < self.config.fresh_write() {
            return Ok(if new_write {
                Evaluation::State(ActivityState::Processing)
            } else {
                Evaluation::Unchanged
            });
        }

        let entry = match transcript::read_last_entry(&latest.path).await {
            Ok(entry) => entry,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.locator.forget(&latest.path);
                return Ok(Evaluation::State(ActivityState::Idle));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(entry) = entry else {
            return Ok(Evaluation::State(ActivityState::Idle));
        };

        let age = entry.age(Utc::now(), file_age);
        let result = classify(&entry, age, &self.thresholds);
        debug!(
            path = %latest.path.display(),
            rule = %result.rule,
            state = %result.state,
            age_secs = age.as_secs(),
            "transcript classified"
        );
        Ok(Evaluation::State(result.state))
    }

    /// Record the latest file's mtime; `true` if it differs from the last one seen.
    fn note_write(&self, latest: &LatestTranscript) -> bool {
        let mut state = self.state.lock().expect("monitor state lock poisoned");
        let seen = Some((latest.path.clone(), latest.modified));
        if state.last_seen == seen {
            return false;
        }
        state.last_seen = seen;
        true
    }

    fn set_state(&self, next: ActivityState) {
        let from = {
            let mut state = self.state.lock().expect("monitor state lock poisoned");
            if state.current == next {
                return;
            }
            let from = state.current;
            state.current = next;
            state.changed_at = Instant::now();
            from
        };

        info!(from = %from, to = %next, "activity state changed");
        self.events.publish(ActivityEvent::StateChange(StateChange {
            from,
            to: next,
            timestamp: Utc::now(),
        }));
        self.events.publish(ActivityEvent::for_state(next));
    }

    fn schedule_check(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.config.debounce();
        self.debounce.arm(move |generation| async move {
            tokio::time::sleep(delay).await;
            if let Some(monitor) = claim(&weak, generation, |m| &m.debounce) {
                if let Err(e) = monitor.check_state().await {
                    warn!(error = %e, "debounced activity check failed");
                }
            }
        });
    }

    fn arm_recheck(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.config.recheck();
        self.recheck.arm(move |generation| async move {
            tokio::time::sleep(delay).await;
            if let Some(monitor) = claim(&weak, generation, |m| &m.recheck) {
                debug!("recheck timer fired");
                if let Err(e) = monitor.check_state().await {
                    warn!(error = %e, "activity recheck failed");
                }
            }
        });
    }
}

fn claim(
    weak: &Weak<ActivityMonitor>,
    generation: u64,
    timer: impl Fn(&ActivityMonitor) -> &Timer,
) -> Option<Arc<ActivityMonitor>> {
    let monitor = weak.upgrade()?;
    timer(&monitor).claim(generation).then_some(monitor)
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        self.debounce.cancel();
        self.recheck.cancel();
    }
}

impl std::fmt::Debug for ActivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityMonitor")
            .field("root", &self.locator.root())
            .field("state", &self.get_current_state())
            .field("watching", &self.is_watching())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn monitor_for(root: &std::path::Path) -> Arc<ActivityMonitor> {
        ActivityMonitor::new(MonitorConfig {
            transcripts_root: root.to_path_buf(),
            ..MonitorConfig::default()
        })
    }

    fn passes(monitor: &ActivityMonitor) -> u64 {
        monitor.passes.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_runs_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor_for(dir.path());

        // Five changes 100ms apart: each one restarts the 500ms debounce.
        for _ in 0..5 {
            monitor.schedule_check();
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(passes(&monitor), 0);
        assert!(monitor.debounce.is_armed());

        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..20 {
            if passes(&monitor) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(passes(&monitor), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(passes(&monitor), 1);
    }

    #[tokio::test]
    async fn overlapping_check_returns_without_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("-home-dev-project");
        fs::create_dir(&project).unwrap();
        fs::write(
            project.join("session.jsonl"),
            format!(
                r#"{{"type":"user","timestamp":"{}","message":{{"role":"user","content":"keep going"}}}}"#,
                Utc::now().to_rfc3339()
            ) + "\n",
        )
        .unwrap();

        let monitor = monitor_for(dir.path());
        let rx = monitor.subscribe();

        // A pass is in progress.
        let in_flight = CheckGuard::acquire(&monitor.checking).unwrap();
        assert_eq!(monitor.check_state().await.unwrap(), ActivityState::Idle);
        assert!(!monitor.is_at_prompt().await);
        assert_eq!(passes(&monitor), 0);
        assert!(rx.try_recv().is_err());

        drop(in_flight);
        assert_eq!(monitor.check_state().await.unwrap(), ActivityState::Processing);
        assert_eq!(passes(&monitor), 1);
        assert!(matches!(rx.try_recv(), Ok(ActivityEvent::StateChange(_))));
    }
}
