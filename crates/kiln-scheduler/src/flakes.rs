//! Flaky task detection
//!
//! Works over terminal task attempts grouped by [`TaskKey`]. A MISHAP is
//! never the code's fault, so it is always flaky. A FAILURE is flaky when
//! another attempt at the same key succeeded.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kiln_core::{Task, TaskKey, TaskStatus};
use serde::Serialize;

/// Outcome counts for one task key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlakeReport {
    pub key: TaskKey,
    pub successes: usize,
    pub failures: usize,
    pub mishaps: usize,
    /// Ids of the attempts classified as flaky, in attempt order
    pub flaky: Vec<String>,
}

impl FlakeReport {
    fn new(key: TaskKey) -> Self {
        Self {
            key,
            successes: 0,
            failures: 0,
            mishaps: 0,
            flaky: Vec::new(),
        }
    }

    pub fn is_flaky(&self) -> bool {
        !self.flaky.is_empty()
    }
}

/// Ids of every terminal task that should not count as a real failure.
///
/// Non-terminal tasks are ignored.
pub fn find_flaky_tasks(tasks: &[Task]) -> BTreeSet<String> {
    flake_reports(tasks)
        .into_iter()
        .flat_map(|report| report.flaky)
        .collect()
}

/// Per-key outcome counts and flaky attempts, in key order
pub fn flake_reports(tasks: &[Task]) -> Vec<FlakeReport> {
    let mut groups: BTreeMap<&TaskKey, Vec<&Task>> = BTreeMap::new();
    for task in tasks.iter().filter(|t| t.status.is_terminal()) {
        groups.entry(&task.key).or_default().push(task);
    }

    groups
        .into_iter()
        .map(|(key, mut attempts)| {
            attempts.sort_by(|a, b| a.attempt.cmp(&b.attempt).then_with(|| a.id.cmp(&b.id)));

            let mut report = FlakeReport::new(key.clone());
            for task in &attempts {
                match task.status {
                    TaskStatus::Success => report.successes += 1,
                    TaskStatus::Failure => report.failures += 1,
                    TaskStatus::Mishap => report.mishaps += 1,
                    TaskStatus::Pending | TaskStatus::Running => {}
                }
            }

            let disagreement = report.successes > 0 && report.failures > 0;
            report.flaky = attempts
                .iter()
                .filter(|t| match t.status {
                    TaskStatus::Mishap => true,
                    TaskStatus::Failure => disagreement,
                    _ => false,
                })
                .map(|t| t.id.clone())
                .collect();
            report
        })
        .collect()
}

/// Tasks that finished at or after `since`
pub fn finished_since(tasks: &[Task], since: DateTime<Utc>) -> Vec<Task> {
    tasks
        .iter()
        .filter(|t| t.finished.is_some_and(|f| f >= since))
        .cloned()
        .collect()
}
