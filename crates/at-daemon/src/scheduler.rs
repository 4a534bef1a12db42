use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use at_bridge::event_bus::EventBus;
use at_bridge::protocol::BridgeMessage;
use at_core::config::QueueConfig;
use at_core::settings::ProjectSettings;
use at_core::task_store::{Subscription, TaskStore, TaskStoreError};
use at_core::types::{ReviewReason, StatusTransition, StoreEvent, Task, TaskStatus};
use at_telemetry::metrics::{global_metrics, names};
use tracing::{debug, info, warn};

use crate::failure_detection;
use crate::guard::FlagGuard;

/// Why a promotion pass stopped before the board was full or the queue empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The queue is blocked; carries the block reason.
    Blocked(String),
    /// Too many promotions failed in a row.
    TooManyFailures(u32),
    /// The task list could not be read.
    StoreUnavailable(String),
}

/// Outcome of one [`QueueScheduler::process_queue`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRunReport {
    /// Task ids moved to `in_progress`, in promotion order.
    pub promoted: Vec<String>,
    /// Promotions that failed to persist.
    pub failures: u32,
    pub aborted: Option<AbortReason>,
    /// Another pass was already running and will sweep again for this caller.
    pub coalesced: bool,
}

/// Snapshot of the queue block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStatus {
    pub blocked: bool,
    pub reason: Option<String>,
    /// The task whose transition set the block, if any.
    pub task_id: Option<String>,
}

#[derive(Default)]
struct BlockState {
    blocked: bool,
    reason: Option<String>,
    offender: Option<String>,
    /// Failed tasks the user chose to move past with a manual unblock.
    acknowledged: HashSet<String>,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    settings: ProjectSettings,
    max_consecutive_failures: u32,
    bus: EventBus,
    block: Mutex<BlockState>,
    /// Bumped every time a block is set.
    block_epoch: AtomicU64,
    processing: AtomicBool,
    rerun: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

/// Promotes queued tasks into `in_progress` under the parallelism cap and
/// blocks promotion when tasks fail.
///
/// The scheduler observes the task store: every status transition is checked
/// for failures the moment it is applied, before the caller that made the
/// change resumes. A block set that way is therefore visible to a promotion
/// pass between two consecutive promotions.
///
/// Cloning shares the scheduler.
#[derive(Clone)]
pub struct QueueScheduler {
    inner: Arc<Inner>,
}

impl QueueScheduler {
    pub fn new(store: Arc<dyn TaskStore>, settings: ProjectSettings, config: &QueueConfig) -> Self {
        Self::with_event_bus(store, settings, config, EventBus::new())
    }

    pub fn with_event_bus(
        store: Arc<dyn TaskStore>,
        settings: ProjectSettings,
        config: &QueueConfig,
        bus: EventBus,
    ) -> Self {
        let inner = Arc::new(Inner {
            store,
            settings,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            bus,
            block: Mutex::new(BlockState::default()),
            block_epoch: AtomicU64::new(0),
            processing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            subscription: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let subscription = inner.store.subscribe(Arc::new(move |event: &StoreEvent| {
            if let Some(inner) = weak.upgrade() {
                QueueScheduler { inner }.on_store_event(event);
            }
        }));
        *inner.subscription.lock().expect("scheduler lock poisoned") = Some(subscription);

        Self { inner }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub fn settings(&self) -> &ProjectSettings {
        &self.inner.settings
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn is_blocked(&self) -> bool {
        self.lock_block().blocked
    }

    pub fn block_reason(&self) -> Option<String> {
        self.lock_block().reason.clone()
    }

    pub fn block_status(&self) -> BlockStatus {
        let block = self.lock_block();
        BlockStatus {
            blocked: block.blocked,
            reason: block.reason.clone(),
            task_id: block.offender.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Promotion
    // -----------------------------------------------------------------------

    /// Promote queued tasks, oldest first, until the board is full, the queue
    /// is empty, or the queue becomes blocked.
    ///
    /// Calls made while a pass is running do not start a second pass; they
    /// mark the running one to sweep again once it finishes.
    pub async fn process_queue(&self) -> QueueRunReport {
        // Request first, then try to run: a pass that is just finishing
        // either sees the request or has already released the flag.
        self.inner.rerun.store(true, Ordering::SeqCst);

        let mut report = QueueRunReport::default();
        let mut passes = 0u32;
        loop {
            let Some(guard) = FlagGuard::acquire(&self.inner.processing) else {
                if passes == 0 {
                    debug!("promotion pass already running, coalescing");
                    report.coalesced = true;
                }
                return report;
            };
            self.inner.rerun.store(false, Ordering::SeqCst);
            self.sweep(&mut report).await;
            passes += 1;
            drop(guard);

            if report.aborted.is_some() || !self.inner.rerun.load(Ordering::SeqCst) {
                return report;
            }
            debug!(passes, "promotion requested during pass, sweeping again");
        }
    }

    /// One promotion sweep. The board is re-read before every promotion so
    /// that changes made while a promotion was persisting are respected.
    async fn sweep(&self, report: &mut QueueRunReport) {
        // Ids attempted in this sweep; each is tried at most once.
        let mut tried: HashSet<String> = HashSet::new();
        let mut consecutive_failures = 0u32;

        loop {
            if let Some(reason) = self.block_reason_if_blocked() {
                if tried.is_empty() {
                    debug!(%reason, "queue blocked, skipping promotion");
                } else {
                    info!(%reason, "queue blocked mid-pass, stopping promotion");
                }
                report.aborted = Some(AbortReason::Blocked(reason));
                return;
            }

            let tasks = match self.inner.store.list_tasks().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(error = %e, "failed to list tasks for promotion");
                    report.aborted = Some(AbortReason::StoreUnavailable(e.to_string()));
                    return;
                }
            };

            // The list read yields; a failure may have landed meanwhile.
            if let Some(reason) = self.block_reason_if_blocked() {
                report.aborted = Some(AbortReason::Blocked(reason));
                return;
            }
            if let Some(reason) = self.check_unacknowledged_failures(&tasks) {
                report.aborted = Some(AbortReason::Blocked(reason));
                return;
            }

            let active = tasks
                .iter()
                .filter(|t| !t.is_archived() && t.status.is_active())
                .count();
            let max = self.inner.settings.max_parallel_tasks();
            if active >= max {
                debug!(active, max, "board full");
                return;
            }

            let Some(task) = tasks
                .iter()
                .filter(|t| {
                    !t.is_archived() && t.status == TaskStatus::Queue && !tried.contains(&t.id)
                })
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            else {
                return;
            };
            tried.insert(task.id.clone());

            match self
                .inner
                .store
                .update_status(&task.id, TaskStatus::InProgress, None)
                .await
            {
                Ok(_) => {
                    consecutive_failures = 0;
                    info!(task_id = %task.id, title = %task.title, active = active + 1, max, "promoted task");
                    global_metrics().increment_counter(names::QUEUE_PROMOTIONS, &[]);
                    self.inner.bus.publish(BridgeMessage::TaskPromoted {
                        task_id: task.id.clone(),
                    });
                    report.promoted.push(task.id.clone());
                }
                Err(e) => {
                    consecutive_failures += 1;
                    report.failures += 1;
                    warn!(task_id = %task.id, error = %e, consecutive_failures, "promotion failed");
                    global_metrics().increment_counter(names::QUEUE_PROMOTION_FAILURES, &[]);
                    if consecutive_failures >= self.inner.max_consecutive_failures {
                        warn!(
                            limit = self.inner.max_consecutive_failures,
                            "too many consecutive promotion failures, aborting pass"
                        );
                        report.aborted = Some(AbortReason::TooManyFailures(consecutive_failures));
                        return;
                    }
                }
            }
        }
    }

    /// Block when a failed task exists that no transition reported and the
    /// user has not moved past. Catches failures that happened while the
    /// scheduler was not watching.
    fn check_unacknowledged_failures(&self, tasks: &[Task]) -> Option<String> {
        if !self.inner.settings.failure_detection() {
            return None;
        }
        let failed = {
            let block = self.lock_block();
            tasks
                .iter()
                .find(|t| !t.is_archived() && t.is_failed() && !block.acknowledged.contains(&t.id))
                .cloned()
        }?;
        let reason = match failed.review_reason {
            Some(r) => format!("task {} is in {} ({r})", failed.id, failed.status),
            None => format!("task {} is in {}", failed.id, failed.status),
        };
        self.block_with(reason.clone(), Some(failed.id));
        Some(reason)
    }

    /// Run a pass in the background, if a runtime is available.
    fn trigger(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, promotion trigger dropped");
            return;
        };
        let scheduler = self.clone();
        handle.spawn(async move {
            scheduler.process_queue().await;
        });
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    /// Block promotion with a reason not tied to a task.
    pub fn block_queue(&self, reason: impl Into<String>) {
        self.block_with(reason.into(), None);
    }

    fn block_with(&self, reason: String, task_id: Option<String>) {
        {
            let mut block = self.lock_block();
            block.blocked = true;
            block.reason = Some(reason.clone());
            block.offender = task_id.clone();
        }
        self.inner.block_epoch.fetch_add(1, Ordering::SeqCst);
        info!(%reason, task_id = ?task_id, "queue blocked");
        global_metrics().set_gauge(names::QUEUE_BLOCKED, &[], 1);
        self.inner
            .bus
            .publish(BridgeMessage::QueueBlocked { reason, task_id });
    }

    /// Clear the block. Returns `false` if the queue was not blocked.
    fn release_block(&self, why: &str) -> bool {
        {
            let mut block = self.lock_block();
            if !block.blocked {
                return false;
            }
            block.blocked = false;
            block.reason = None;
            block.offender = None;
        }
        info!(why, "queue unblocked");
        global_metrics().set_gauge(names::QUEUE_BLOCKED, &[], 0);
        self.inner.bus.publish(BridgeMessage::QueueUnblocked);
        true
    }

    /// Explicit unblock by the user.
    ///
    /// Tasks currently sitting in a failure state are acknowledged so the
    /// next pass does not immediately block on them again. A failure that
    /// lands while the task list is being read keeps its own block.
    pub async fn unblock_queue(&self) -> QueueRunReport {
        let epoch = self.inner.block_epoch.load(Ordering::SeqCst);
        let failed: Vec<String> = match self.inner.store.list_tasks().await {
            Ok(tasks) => tasks
                .into_iter()
                .filter(|t| !t.is_archived() && t.is_failed())
                .map(|t| t.id)
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not list failed tasks while unblocking");
                Vec::new()
            }
        };

        if self.inner.block_epoch.load(Ordering::SeqCst) != epoch {
            info!("new failure arrived during unblock, keeping the block");
            return self.process_queue().await;
        }

        self.lock_block().acknowledged.extend(failed);
        self.release_block("manual unblock");
        self.process_queue().await
    }

    // -----------------------------------------------------------------------
    // User actions and settings
    // -----------------------------------------------------------------------

    /// Move a task as a user dragging it across the board would.
    ///
    /// Dropping a task on `in_progress` while the queue is blocked persists
    /// the move and then unblocks. Dropping it there while the board is full
    /// parks it in `queue` instead. A move into `human_review` is recorded as
    /// a user stop. Returns the status the task ended up in.
    pub async fn move_task(&self, id: &str, target: TaskStatus) -> Result<TaskStatus, TaskStoreError> {
        if target != TaskStatus::InProgress {
            let reason = (target == TaskStatus::HumanReview).then_some(ReviewReason::Stopped);
            self.inner.store.update_status(id, target, reason).await?;
            return Ok(target);
        }

        if self.is_blocked() {
            self.inner
                .store
                .update_status(id, TaskStatus::InProgress, None)
                .await?;
            info!(task_id = id, "task started by hand while blocked, unblocking");
            self.unblock_queue().await;
            return Ok(TaskStatus::InProgress);
        }

        let tasks = self.inner.store.list_tasks().await?;
        let Some(task) = tasks.iter().find(|t| t.id == id) else {
            return Err(TaskStoreError::NotFound(id.to_string()));
        };
        if task.status.is_active() {
            return Ok(TaskStatus::InProgress);
        }
        let active = tasks
            .iter()
            .filter(|t| !t.is_archived() && t.status.is_active())
            .count();
        let max = self.inner.settings.max_parallel_tasks();
        let status = if active >= max {
            debug!(task_id = id, active, max, "board full, queueing instead");
            TaskStatus::Queue
        } else {
            TaskStatus::InProgress
        };
        self.inner.store.update_status(id, status, None).await?;
        Ok(status)
    }

    /// Change the parallelism cap. Raising it runs a promotion pass, whose
    /// report is returned.
    pub async fn set_max_parallel_tasks(&self, max: usize) -> Option<QueueRunReport> {
        let previous = self.inner.settings.set_max_parallel_tasks(max);
        let current = self.inner.settings.max_parallel_tasks();
        info!(previous, current, "max parallel tasks changed");
        if current > previous {
            Some(self.process_queue().await)
        } else {
            None
        }
    }

    /// Toggle failure detection. Turning it off clears any block and runs a
    /// promotion pass.
    pub async fn set_failure_detection(&self, enabled: bool) -> Option<QueueRunReport> {
        let previous = self.inner.settings.set_failure_detection(enabled);
        info!(previous, enabled, "failure detection changed");
        if enabled {
            return None;
        }
        self.release_block("failure detection disabled");
        Some(self.process_queue().await)
    }

    // -----------------------------------------------------------------------
    // Store observation
    // -----------------------------------------------------------------------

    fn on_store_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Transition(transition) => self.on_transition(transition),
            StoreEvent::Retired { task_id } => {
                let was_offender = {
                    let mut block = self.lock_block();
                    block.acknowledged.remove(task_id);
                    block.blocked && block.offender.as_deref() == Some(task_id.as_str())
                };
                if was_offender && self.release_block("blocking task removed") {
                    self.trigger();
                }
            }
        }
    }

    fn on_transition(&self, t: &StatusTransition) {
        self.inner.bus.publish(BridgeMessage::TaskStatusChanged {
            task_id: t.task_id.clone(),
            from: t.from,
            to: t.to,
            review_reason: t.review_reason,
        });

        let detection = self.inner.settings.failure_detection();
        let offender_recovered = {
            let mut block = self.lock_block();
            block.acknowledged.remove(&t.task_id);
            block.blocked && block.offender.as_deref() == Some(t.task_id.as_str())
        };

        if detection {
            if let Some(kind) = failure_detection::detect(t) {
                self.block_with(kind.describe(t), Some(t.task_id.clone()));
                return;
            }
        }

        if offender_recovered && !t.lands_in_failure() {
            if self.release_block("blocking task left its failure state") {
                self.trigger();
            }
            return;
        }

        if t.frees_slot() {
            if detection && t.is_user_stop() {
                debug!(task_id = %t.task_id, "task stopped by user, slot left empty");
                return;
            }
            debug!(task_id = %t.task_id, to = %t.to, "slot freed");
            self.trigger();
        }
    }

    fn block_reason_if_blocked(&self) -> Option<String> {
        let block = self.lock_block();
        if block.blocked {
            Some(block.reason.clone().unwrap_or_default())
        } else {
            None
        }
    }

    fn lock_block(&self) -> std::sync::MutexGuard<'_, BlockState> {
        self.inner.block.lock().expect("scheduler lock poisoned")
    }
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("block", &self.block_status())
            .field("max_parallel_tasks", &self.inner.settings.max_parallel_tasks())
            .finish()
    }
}
