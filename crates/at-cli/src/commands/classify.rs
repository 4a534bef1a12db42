use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use at_agents::classifier::{classify, Thresholds};
use at_agents::transcript::{self, EntryKind, StopReason};
use at_core::config::MonitorConfig;
use chrono::Utc;
use serde_json::json;

use super::one_line;

pub async fn run(file: &Path, monitor: &MonitorConfig, json_output: bool) -> Result<()> {
    let modified = tokio::fs::metadata(file)
        .await
        .and_then(|m| m.modified())
        .with_context(|| format!("cannot stat {}", file.display()))?;
    let file_age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();

    let entry = transcript::read_last_entry(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;

    let Some(entry) = entry else {
        if json_output {
            println!("{}", json!({ "state": "IDLE", "rule": "no_entries" }));
        } else {
            println!("state:       IDLE (no user or assistant entries)");
        }
        return Ok(());
    };

    let age = entry.age(Utc::now(), file_age);
    let verdict = classify(&entry, age, &Thresholds::from_config(monitor));
    let kind = match entry.kind {
        EntryKind::User => "user",
        EntryKind::Assistant => "assistant",
    };
    let stop = match &entry.stop_reason {
        None => "null".to_string(),
        Some(StopReason::EndTurn) => "end_turn".to_string(),
        Some(StopReason::ToolUse) => "tool_use".to_string(),
        Some(StopReason::Other(other)) => other.clone(),
    };

    if json_output {
        let out = json!({
            "state": verdict.state,
            "rule": verdict.rule.as_str(),
            "entry": kind,
            "stop_reason": stop,
            "age_secs": age.as_secs(),
            "file_age_secs": file_age.as_secs(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("state:       {}", verdict.state);
    println!("rule:        {}", verdict.rule);
    println!("entry:       {kind}");
    println!("stop_reason: {stop}");
    println!("age:         {}s (file {}s)", age.as_secs(), file_age.as_secs());
    if let Some(text) = &entry.last_text {
        println!("last text:   {}", one_line(text, 80));
    }
    Ok(())
}
