use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use at_core::config::QueueConfig;
use at_core::settings::ProjectSettings;
use at_core::task_store::{JsonTaskStore, TaskStore};
use at_core::types::{Task, TaskStatus};
use at_daemon::scheduler::{AbortReason, BlockStatus, QueueRunReport, QueueScheduler};
use at_telemetry::metrics::global_metrics;

/// Run one promotion pass against a JSON task file and print the result.
pub async fn run(
    tasks_file: &Path,
    queue: &QueueConfig,
    max: Option<usize>,
    unblock: bool,
    metrics: bool,
) -> Result<()> {
    let store = JsonTaskStore::open(tasks_file)
        .await
        .with_context(|| format!("cannot open {}", tasks_file.display()))?;
    let store: Arc<dyn TaskStore> = Arc::new(store);

    let settings = ProjectSettings::from_config(queue);
    if let Some(max) = max {
        settings.set_max_parallel_tasks(max);
    }
    let scheduler = QueueScheduler::new(Arc::clone(&store), settings.clone(), queue);

    let report = if unblock {
        scheduler.unblock_queue().await
    } else {
        scheduler.process_queue().await
    };

    let tasks = store.list_tasks().await?;
    print!(
        "{}",
        render(&report, &scheduler.block_status(), &tasks, settings.max_parallel_tasks())
    );
    if metrics {
        print!("\n{}", global_metrics().export_prometheus());
    }
    Ok(())
}

fn render(report: &QueueRunReport, block: &BlockStatus, tasks: &[Task], max: usize) -> String {
    let mut out = String::new();

    if report.promoted.is_empty() {
        out.push_str("promoted:  none\n");
    } else {
        out.push_str(&format!("promoted:  {}\n", report.promoted.join(", ")));
    }
    if report.failures > 0 {
        out.push_str(&format!("failures:  {}\n", report.failures));
    }
    match &report.aborted {
        Some(AbortReason::Blocked(_)) | None => {}
        Some(AbortReason::TooManyFailures(n)) => {
            out.push_str(&format!("aborted:   {n} consecutive promotion failures\n"));
        }
        Some(AbortReason::StoreUnavailable(e)) => {
            out.push_str(&format!("aborted:   task store unavailable: {e}\n"));
        }
    }
    if block.blocked {
        out.push_str(&format!(
            "blocked:   {}\n",
            block.reason.as_deref().unwrap_or("no reason given")
        ));
    }

    let mut columns: BTreeMap<usize, (TaskStatus, usize)> = BTreeMap::new();
    for task in tasks.iter().filter(|t| !t.is_archived()) {
        let column = task.status.board_column();
        let rank = TaskStatus::columns()
            .iter()
            .position(|c| *c == column)
            .unwrap_or(usize::MAX);
        columns.entry(rank).or_insert((column, 0)).1 += 1;
    }
    let active = tasks
        .iter()
        .filter(|t| !t.is_archived() && t.status.is_active())
        .count();
    out.push_str(&format!("active:    {active}/{max}\n"));
    for (column, count) in columns.values() {
        out.push_str(&format!("  {:<13}{count}\n", column.as_str()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_summarises_board() {
        let report = QueueRunReport {
            promoted: vec!["002-b".into()],
            ..Default::default()
        };
        let block = BlockStatus::default();
        let tasks = vec![
            Task::new("001-a", "a").with_status(TaskStatus::InProgress),
            Task::new("002-b", "b").with_status(TaskStatus::InProgress),
            Task::new("003-c", "c").with_status(TaskStatus::Queue),
            Task::new("004-d", "d").with_status(TaskStatus::Error),
        ];

        let text = render(&report, &block, &tasks, 2);
        assert_eq!(
            text,
            "promoted:  002-b\n\
             active:    2/2\n  \
             queue        1\n  \
             in_progress  2\n  \
             human_review 1\n"
        );
    }

    #[test]
    fn render_shows_block_reason() {
        let report = QueueRunReport {
            aborted: Some(AbortReason::Blocked("regression".into())),
            ..Default::default()
        };
        let block = BlockStatus {
            blocked: true,
            reason: Some("regression: task 001-a moved in_progress -> backlog".into()),
            task_id: Some("001-a".into()),
        };
        let text = render(&report, &block, &[], 3);
        assert!(text.starts_with("promoted:  none\nblocked:   regression: task 001-a"));
        assert!(text.ends_with("active:    0/3\n"));
    }
}
