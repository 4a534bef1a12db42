//! Rules that turn an observed status transition into a queue block.

use at_core::types::{StatusTransition, TaskStatus};

/// Why a transition blocks the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// An active task was reset to the not-started column.
    Regression,
    /// An active task landed in human review for a reason other than a user stop.
    ExecutionFailure,
    /// A task under automated review landed in human review the same way.
    ReviewFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Regression => "regression",
            FailureKind::ExecutionFailure => "execution failure",
            FailureKind::ReviewFailure => "review failure",
        }
    }

    /// Human-readable block reason naming the task and the transition.
    pub fn describe(&self, t: &StatusTransition) -> String {
        let reason = t
            .review_reason
            .map(|r| format!(" ({r})"))
            .unwrap_or_default();
        format!(
            "{}: task {} moved {} -> {}{}",
            self.as_str(),
            t.task_id,
            t.from,
            t.to,
            reason
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a transition. `None` means it does not block.
pub fn detect(t: &StatusTransition) -> Option<FailureKind> {
    if t.is_regression() {
        return Some(FailureKind::Regression);
    }
    if !t.lands_in_failure() {
        return None;
    }
    match t.from {
        TaskStatus::InProgress => Some(FailureKind::ExecutionFailure),
        TaskStatus::AiReview => Some(FailureKind::ReviewFailure),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use at_core::types::ReviewReason;
    use TaskStatus::*;

    fn t(from: TaskStatus, to: TaskStatus, reason: Option<ReviewReason>) -> StatusTransition {
        StatusTransition::new("007-cache", from, to, reason)
    }

    #[test]
    fn blocking_edges() {
        assert_eq!(detect(&t(InProgress, Backlog, None)), Some(FailureKind::Regression));
        assert_eq!(
            detect(&t(InProgress, HumanReview, Some(ReviewReason::Errors))),
            Some(FailureKind::ExecutionFailure)
        );
        assert_eq!(detect(&t(InProgress, Error, None)), Some(FailureKind::ExecutionFailure));
        assert_eq!(
            detect(&t(AiReview, HumanReview, Some(ReviewReason::QaRejected))),
            Some(FailureKind::ReviewFailure)
        );
    }

    #[test]
    fn non_blocking_edges() {
        assert_eq!(detect(&t(InProgress, HumanReview, Some(ReviewReason::Stopped))), None);
        assert_eq!(detect(&t(AiReview, HumanReview, Some(ReviewReason::Completed))), None);
        assert_eq!(detect(&t(InProgress, AiReview, None)), None);
        assert_eq!(detect(&t(Queue, Backlog, None)), None);
        // Failures outside the active/review columns are left to the store guard.
        assert_eq!(detect(&t(Backlog, HumanReview, Some(ReviewReason::Errors))), None);
    }

    #[test]
    fn description_names_task_and_reason() {
        let tr = t(InProgress, HumanReview, Some(ReviewReason::Errors));
        let text = FailureKind::ExecutionFailure.describe(&tr);
        assert_eq!(
            text,
            "execution failure: task 007-cache moved in_progress -> human_review (errors)"
        );
    }
}
