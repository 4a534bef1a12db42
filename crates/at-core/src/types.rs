use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle column of a task on the kanban board.
///
/// `PrCreated` and `Error` are terminal variants that render inside the
/// `Done` and `HumanReview` columns respectively (see [`TaskStatus::board_column`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Queue,
    InProgress,
    AiReview,
    HumanReview,
    Done,
    PrCreated,
    Error,
}

impl TaskStatus {
    /// The ordered board columns, left to right.
    pub fn columns() -> &'static [TaskStatus] {
        &[
            TaskStatus::Backlog,
            TaskStatus::Queue,
            TaskStatus::InProgress,
            TaskStatus::AiReview,
            TaskStatus::HumanReview,
            TaskStatus::Done,
        ]
    }

    /// The column this status is rendered in.
    pub fn board_column(&self) -> TaskStatus {
        match self {
            TaskStatus::PrCreated => TaskStatus::Done,
            TaskStatus::Error => TaskStatus::HumanReview,
            other => *other,
        }
    }

    /// `true` for the status that occupies an execution slot.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::InProgress)
    }

    /// `true` once no further agent work is expected.
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::PrCreated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Queue => "queue",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AiReview => "ai_review",
            TaskStatus::HumanReview => "human_review",
            TaskStatus::Done => "done",
            TaskStatus::PrCreated => "pr_created",
            TaskStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReviewReason
// ---------------------------------------------------------------------------

/// Why a task landed in `human_review`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    Completed,
    Errors,
    QaRejected,
    PlanReview,
    Stopped,
}

impl ReviewReason {
    /// Reasons that mean the agent's work failed, as opposed to finishing or
    /// being paused on purpose.
    pub fn is_failure(&self) -> bool {
        matches!(self, ReviewReason::Errors | ReviewReason::QaRejected)
    }
}

impl std::fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewReason::Completed => "completed",
            ReviewReason::Errors => "errors",
            ReviewReason::QaRejected => "qa_rejected",
            ReviewReason::PlanReview => "plan_review",
            ReviewReason::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// SubtaskStatus / Subtask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    pub status: SubtaskStatus,
}

impl Subtask {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: SubtaskStatus::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskMetadata
// ---------------------------------------------------------------------------

/// Flags and counters attached to a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Soft-delete marker.
    #[serde(default)]
    pub archived: bool,
    /// Opt this task out of automatic recovery messages.
    #[serde(default)]
    pub rdr_disabled: bool,
    /// Request recovery even when the status alone would not call for it.
    #[serde(default)]
    pub force_recovery: bool,
    /// Number of recovery messages that have named this task.
    #[serde(default)]
    pub rdr_attempts: u32,
    #[serde(default)]
    pub last_rdr_at: Option<DateTime<Utc>>,
    /// Set when the persisted plan for this task could not be parsed.
    #[serde(default)]
    pub plan_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task identifier, e.g. `003-add-login`.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub review_reason: Option<ReviewReason>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Backlog,
            review_reason: None,
            subtasks: Vec::new(),
            metadata: TaskMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style status override, mostly useful for fixtures.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Apply a status change. The review reason only survives in `human_review`.
    pub fn set_status(&mut self, status: TaskStatus, reason: Option<ReviewReason>) {
        self.status = status;
        self.review_reason = if status == TaskStatus::HumanReview {
            reason
        } else {
            None
        };
        self.updated_at = Utc::now();
    }

    pub fn is_archived(&self) -> bool {
        self.metadata.archived
    }

    pub fn completed_subtasks(&self) -> usize {
        self.subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .count()
    }

    /// `true` when some subtask has been completed, i.e. work was started.
    pub fn has_progress(&self) -> bool {
        self.completed_subtasks() > 0
    }

    /// A task sitting in review because the agent failed.
    pub fn is_failed_review(&self) -> bool {
        self.status == TaskStatus::HumanReview
            && self.review_reason.is_some_and(|r| r.is_failure())
    }

    /// See [`is_failure_landing`].
    pub fn is_failed(&self) -> bool {
        is_failure_landing(self.status, self.review_reason)
    }
}

/// `true` when a task in `status` with `reason` is there because work failed:
/// the `error` status, or `human_review` for errors, QA rejection, or no
/// stated reason. Completed work, plan review and user stops are not failures.
pub fn is_failure_landing(status: TaskStatus, reason: Option<ReviewReason>) -> bool {
    match status {
        TaskStatus::Error => true,
        TaskStatus::HumanReview => reason.is_none_or(|r| r.is_failure()),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Store events
// ---------------------------------------------------------------------------

/// A status change observed on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub review_reason: Option<ReviewReason>,
    pub at: DateTime<Utc>,
}

impl StatusTransition {
    pub fn new(
        task_id: impl Into<String>,
        from: TaskStatus,
        to: TaskStatus,
        review_reason: Option<ReviewReason>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            from,
            to,
            review_reason,
            at: Utc::now(),
        }
    }

    /// An active task went back to the not-started column.
    pub fn is_regression(&self) -> bool {
        self.from == TaskStatus::InProgress && self.to == TaskStatus::Backlog
    }

    /// An active slot was released.
    pub fn frees_slot(&self) -> bool {
        self.from.is_active() && !self.to.is_active()
    }

    /// The task now sits in a failure state.
    pub fn lands_in_failure(&self) -> bool {
        is_failure_landing(self.to, self.review_reason)
    }

    /// Landed in human review because the user explicitly stopped the task.
    pub fn is_user_stop(&self) -> bool {
        self.to == TaskStatus::HumanReview && self.review_reason == Some(ReviewReason::Stopped)
    }
}

/// Everything a task store reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Transition(StatusTransition),
    /// The task was deleted or archived and no longer takes part in scheduling.
    Retired { task_id: String },
}

// ---------------------------------------------------------------------------
// ActivityState
// ---------------------------------------------------------------------------

/// Inferred activity of the externally running coding agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    /// Waiting for input; safe to type into the session.
    AtPrompt,
    /// Mid-turn; must not be interrupted.
    Processing,
    /// Session ended or abandoned.
    Idle,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityState::AtPrompt => "AT_PROMPT",
            ActivityState::Processing => "PROCESSING",
            ActivityState::Idle => "IDLE",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
