//! Selection of tasks that need intervention and the text of the recovery
//! message sent to the agent about them.

use std::fmt::Write as _;
use std::time::Duration;

use at_core::types::{ReviewReason, Task, TaskStatus};
use chrono::{DateTime, Utc};

/// Priority tier of an intervention, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Failed or stopped without previous recovery; can simply be resumed.
    Restartable,
    /// Already named in earlier recovery messages.
    InRecovery,
    /// Persisted plan could not be parsed.
    Corrupted,
    /// Automatic attempts exhausted; needs a human.
    Escalate,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Restartable, Tier::InRecovery, Tier::Corrupted, Tier::Escalate];

    fn heading(&self) -> &'static str {
        match self {
            Tier::Restartable => "P1 restart",
            Tier::InRecovery => "P2 continue recovery",
            Tier::Corrupted => "P3 repair corrupted state",
            Tier::Escalate => "P4 escalate",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Tier::Restartable => {
                "Resume each task from its implementation plan and fix whatever stopped it."
            }
            Tier::InRecovery => {
                "These were reported before and are still stuck. Read the latest errors before retrying; change approach if the same step keeps failing."
            }
            Tier::Corrupted => {
                "The saved plan for these tasks does not parse. Rewrite the plan file so it is valid JSON, then resume the task."
            }
            Tier::Escalate => {
                "Automatic recovery gave up on these. Do not retry; write a short summary of the blocker so a human can take over."
            }
        }
    }
}

/// What made a task qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Review(ReviewReason),
    Errored,
    Forced,
    Stalled,
    Regressed,
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cause::Review(reason) => write!(f, "human_review: {reason}"),
            Cause::Errored => f.write_str("error"),
            Cause::Forced => f.write_str("recovery requested"),
            Cause::Stalled => f.write_str("in_progress with no recent updates"),
            Cause::Regressed => f.write_str("reset to backlog with work done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterventionPolicy {
    pub max_attempts: u32,
    pub stall_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intervention {
    pub task_id: String,
    pub title: String,
    pub tier: Tier,
    pub cause: Cause,
    pub attempts: u32,
    pub plan_error: Option<String>,
}

/// Why `task` needs intervention, or `None` if it does not.
pub fn needs_intervention(task: &Task, policy: &InterventionPolicy, now: DateTime<Utc>) -> Option<Cause> {
    if task.is_archived() || task.metadata.rdr_disabled || task.status.is_finished() {
        return None;
    }
    if task.metadata.force_recovery {
        return Some(Cause::Forced);
    }
    match task.status {
        TaskStatus::HumanReview => match task.review_reason {
            Some(r @ (ReviewReason::Errors | ReviewReason::QaRejected | ReviewReason::Stopped)) => {
                Some(Cause::Review(r))
            }
            _ => None,
        },
        TaskStatus::Error => Some(Cause::Errored),
        TaskStatus::InProgress => {
            let idle = (now - task.updated_at).to_std().unwrap_or(Duration::ZERO);
            (idle > policy.stall_after).then_some(Cause::Stalled)
        }
        TaskStatus::Backlog if task.has_progress() => Some(Cause::Regressed),
        _ => None,
    }
}

pub fn tier_for(task: &Task, policy: &InterventionPolicy) -> Tier {
    if task.metadata.plan_error.is_some() {
        Tier::Corrupted
    } else if task.metadata.rdr_attempts >= policy.max_attempts {
        Tier::Escalate
    } else if task.metadata.rdr_attempts > 0 {
        Tier::InRecovery
    } else {
        Tier::Restartable
    }
}

/// Tasks that need intervention, ordered by tier and then age.
pub fn collect_interventions(
    tasks: &[Task],
    policy: &InterventionPolicy,
    now: DateTime<Utc>,
) -> Vec<Intervention> {
    let mut found: Vec<(&Task, Intervention)> = tasks
        .iter()
        .filter_map(|task| {
            let cause = needs_intervention(task, policy, now)?;
            Some((
                task,
                Intervention {
                    task_id: task.id.clone(),
                    title: task.title.clone(),
                    tier: tier_for(task, policy),
                    cause,
                    attempts: task.metadata.rdr_attempts,
                    plan_error: task.metadata.plan_error.clone(),
                },
            ))
        })
        .collect();
    found.sort_by(|(a, ia), (b, ib)| {
        ia.tier
            .cmp(&ib.tier)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    found.into_iter().map(|(_, i)| i).collect()
}

/// A composed message and the tasks it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryMessage {
    pub text: String,
    pub task_ids: Vec<String>,
}

/// Render one section per non-empty tier.
pub fn compose(interventions: &[Intervention], policy: &InterventionPolicy) -> RecoveryMessage {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "[auto-claude recovery] {} task(s) need attention.",
        interventions.len()
    );

    for tier in Tier::ALL {
        let members: Vec<&Intervention> = interventions.iter().filter(|i| i.tier == tier).collect();
        if members.is_empty() {
            continue;
        }
        let _ = writeln!(text, "\n## {}", tier.heading());
        for i in &members {
            let _ = write!(text, "- {} \"{}\" ({})", i.task_id, i.title, i.cause);
            match tier {
                Tier::InRecovery => {
                    let _ = write!(text, ", attempt {} of {}", i.attempts + 1, policy.max_attempts);
                }
                Tier::Escalate => {
                    let _ = write!(text, ", {} attempts made", i.attempts);
                }
                Tier::Corrupted => {
                    if let Some(err) = &i.plan_error {
                        let _ = write!(text, ", plan error: {err}");
                    }
                }
                Tier::Restartable => {}
            }
            text.push('\n');
        }
        let _ = writeln!(text, "Action: {}", tier.action());
    }

    RecoveryMessage {
        text: text.trim_end().to_string(),
        task_ids: interventions.iter().map(|i| i.task_id.clone()).collect(),
    }
}
