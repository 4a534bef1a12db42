//! Pure activity classification.
//!
//! Maps the last transcript entry plus its age onto an [`ActivityState`].
//! No I/O and no clock access happen here; the monitor supplies both.

use std::sync::OnceLock;
use std::time::Duration;

use at_core::config::MonitorConfig;
use at_core::types::ActivityState;
use regex::Regex;

use crate::transcript::{EntryKind, StopReason, TranscriptEntry};

/// Age thresholds used by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub streaming_grace: Duration,
    pub question_max_age: Duration,
    pub end_turn_grace: Duration,
    pub abandoned_user: Duration,
}

impl Thresholds {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            streaming_grace: Duration::from_secs(config.streaming_grace_secs),
            question_max_age: Duration::from_secs(config.question_max_age_secs),
            end_turn_grace: Duration::from_secs(config.end_turn_grace_secs),
            abandoned_user: Duration::from_secs(config.abandoned_user_secs),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

/// Which row of the decision table produced a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    AbandonedUserTurn,
    PendingUserTurn,
    ToolUse,
    Streaming,
    FreshQuestion,
    StaleQuestion,
    ShellPrompt,
    RecentEndTurn,
    Finished,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::AbandonedUserTurn => "abandoned_user_turn",
            Rule::PendingUserTurn => "pending_user_turn",
            Rule::ToolUse => "tool_use",
            Rule::Streaming => "streaming",
            Rule::FreshQuestion => "fresh_question",
            Rule::StaleQuestion => "stale_question",
            Rule::ShellPrompt => "shell_prompt",
            Rule::RecentEndTurn => "recent_end_turn",
            Rule::Finished => "finished",
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: ActivityState,
    pub rule: Rule,
}

impl Classification {
    fn new(state: ActivityState, rule: Rule) -> Self {
        Self { state, rule }
    }
}

fn question_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)\?[ \t]*$").expect("valid question regex"))
}

fn shell_prompt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*[>❯][ \t]*$").expect("valid prompt regex"))
}

/// `true` if the text ends with a question mark, or any of its lines does.
pub fn ends_with_question(text: &str) -> bool {
    text.trim_end().ends_with('?') || question_re().is_match(text)
}

/// `true` if some line consists of nothing but a `>` (or `❯`) prompt marker.
pub fn looks_like_shell_prompt(text: &str) -> bool {
    shell_prompt_re().is_match(text)
}

/// Classify the last transcript entry given its age.
pub fn classify(entry: &TranscriptEntry, age: Duration, thresholds: &Thresholds) -> Classification {
    use ActivityState::*;

    match entry.kind {
        EntryKind::User if age > thresholds.abandoned_user => {
            Classification::new(Idle, Rule::AbandonedUserTurn)
        }
        EntryKind::User => Classification::new(Processing, Rule::PendingUserTurn),
        EntryKind::Assistant => match entry.stop_reason {
            Some(StopReason::ToolUse) => Classification::new(Processing, Rule::ToolUse),
            None if age < thresholds.streaming_grace => {
                Classification::new(Processing, Rule::Streaming)
            }
            _ => classify_content(entry, age, thresholds),
        },
    }
}

fn classify_content(entry: &TranscriptEntry, age: Duration, thresholds: &Thresholds) -> Classification {
    use ActivityState::*;

    let text = entry.last_text.as_deref().unwrap_or("");
    if ends_with_question(text) {
        return if age <= thresholds.question_max_age {
            Classification::new(AtPrompt, Rule::FreshQuestion)
        } else {
            Classification::new(Idle, Rule::StaleQuestion)
        };
    }
    if looks_like_shell_prompt(text) {
        return Classification::new(AtPrompt, Rule::ShellPrompt);
    }
    if entry.stop_reason == Some(StopReason::EndTurn) && age < thresholds.end_turn_grace {
        return Classification::new(Processing, Rule::RecentEndTurn);
    }
    Classification::new(Idle, Rule::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(stop: Option<StopReason>, text: Option<&str>) -> TranscriptEntry {
        TranscriptEntry {
            kind: EntryKind::Assistant,
            stop_reason: stop,
            timestamp: None,
            last_text: text.map(str::to_string),
        }
    }

    fn user() -> TranscriptEntry {
        TranscriptEntry {
            kind: EntryKind::User,
            stop_reason: None,
            timestamp: None,
            last_text: Some("please continue".into()),
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn decision_table() {
        let th = Thresholds::default();
        let cases = [
            (user(), secs(360), ActivityState::Idle, Rule::AbandonedUserTurn),
            (user(), secs(20), ActivityState::Processing, Rule::PendingUserTurn),
            (
                assistant(Some(StopReason::ToolUse), None),
                secs(3600),
                ActivityState::Processing,
                Rule::ToolUse,
            ),
            (assistant(None, None), secs(5), ActivityState::Processing, Rule::Streaming),
            (assistant(None, Some("Done.")), secs(12), ActivityState::Idle, Rule::Finished),
            (
                assistant(Some(StopReason::EndTurn), Some("Which file should I edit?")),
                secs(15),
                ActivityState::AtPrompt,
                Rule::FreshQuestion,
            ),
            (
                assistant(Some(StopReason::EndTurn), Some("Which file should I edit?")),
                secs(45),
                ActivityState::Idle,
                Rule::StaleQuestion,
            ),
            (
                assistant(Some(StopReason::EndTurn), Some("Ready.\n>")),
                secs(120),
                ActivityState::AtPrompt,
                Rule::ShellPrompt,
            ),
            (
                assistant(Some(StopReason::EndTurn), Some("All tests pass.")),
                secs(4),
                ActivityState::Processing,
                Rule::RecentEndTurn,
            ),
            (
                assistant(Some(StopReason::EndTurn), Some("All tests pass.")),
                secs(11),
                ActivityState::Idle,
                Rule::Finished,
            ),
        ];

        for (entry, age, state, rule) in cases {
            let got = classify(&entry, age, &th);
            assert_eq!(got, Classification { state, rule }, "entry {entry:?} age {age:?}");
        }
    }

    #[test]
    fn question_on_any_line_counts() {
        assert!(ends_with_question("Should I also update the docs?\n\n- option A\n- option B"));
        assert!(ends_with_question("Options below.\nProceed with A?  \nThanks"));
        assert!(ends_with_question("Proceed?   \n"));
        assert!(!ends_with_question("The ? operator propagates errors."));
    }

    #[test]
    fn prompt_marker_must_stand_alone() {
        assert!(looks_like_shell_prompt("output\n  >  \n"));
        assert!(looks_like_shell_prompt("❯"));
        assert!(!looks_like_shell_prompt("a > b"));
        assert!(!looks_like_shell_prompt("> quoted reply"));
    }

    #[test]
    fn question_boundary_is_inclusive() {
        let th = Thresholds::default();
        let entry = assistant(Some(StopReason::EndTurn), Some("Continue?"));
        assert_eq!(classify(&entry, secs(30), &th).state, ActivityState::AtPrompt);
        assert_eq!(classify(&entry, secs(31), &th).state, ActivityState::Idle);
    }

    #[test]
    fn user_boundary_is_strictly_older() {
        let th = Thresholds::default();
        assert_eq!(classify(&user(), secs(300), &th).state, ActivityState::Processing);
        assert_eq!(classify(&user(), secs(301), &th).state, ActivityState::Idle);
    }

    #[test]
    fn other_stop_reasons_fall_through_to_content() {
        let th = Thresholds::default();
        let entry = assistant(Some(StopReason::Other("max_tokens".into())), Some("cut off"));
        assert_eq!(classify(&entry, secs(2), &th), Classification::new(ActivityState::Idle, Rule::Finished));
    }
}
