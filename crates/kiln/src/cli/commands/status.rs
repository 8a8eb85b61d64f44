//! Status command

use std::collections::BTreeMap;

use clap::Args;
use console::style;
use serde::Serialize;
use tracing::info;

use kiln_core::config::load_config_or_default;
use kiln_core::{JobStatus, TaskStatus};
use kiln_scheduler::StoreSnapshot;

use crate::cli::{engine, output, Cli, OutputFormat};

/// Show jobs and tasks from the state file
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Include archived jobs
    #[arg(short, long)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
struct JobRow {
    id: String,
    name: String,
    revision: String,
    trigger: String,
    status: JobStatus,
    finished: bool,
}

#[derive(Debug, Default, Serialize)]
struct StatusReport {
    jobs: Vec<JobRow>,
    tasks_by_status: BTreeMap<String, usize>,
    retry_queue: usize,
    outstanding_dispatches: usize,
    queued_periodic: usize,
}

impl StatusReport {
    fn from_snapshot(snapshot: &StoreSnapshot, all: bool) -> Self {
        let mut jobs: Vec<JobRow> = snapshot
            .jobs
            .values()
            .filter(|j| all || j.finished.is_none())
            .map(|j| JobRow {
                id: j.id.to_string(),
                name: j.name.clone(),
                revision: j.revision.clone(),
                trigger: j.trigger.to_string(),
                status: j.derive_status(),
                finished: j.finished.is_some(),
            })
            .collect();
        jobs.sort_by(|a, b| a.revision.cmp(&b.revision).then(a.name.cmp(&b.name)));

        let mut tasks_by_status = BTreeMap::new();
        for task in snapshot.tasks.values() {
            *tasks_by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        Self {
            jobs,
            tasks_by_status,
            retry_queue: snapshot.retry_queue.len(),
            outstanding_dispatches: snapshot.intents.values().filter(|i| !i.abandoned).count(),
            queued_periodic: snapshot.periodic_queue.len(),
        }
    }
}

impl StatusCommand {
    /// Execute the status command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(all = self.all, "executing status command");
        let cwd = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&cwd);
        let store = engine::open_store(&config)?;
        let report = StatusReport::from_snapshot(&store.snapshot().await, self.all);

        match cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Text => {
                println!("{}", style("Kiln Status").bold());
                println!();

                println!("{}", style("Configuration").underlined());
                match config_path {
                    Some(path) => println!("  Config file: {}", output::path_style().apply_to(path.display())),
                    None => println!("  Config file: {} (using defaults)", style("not found").yellow()),
                }
                match store.path() {
                    Some(path) => println!("  State file:  {}", output::path_style().apply_to(path.display())),
                    None => println!("  State file:  {}", style("none").yellow()),
                }
                println!();

                println!("{}", style("Jobs").underlined());
                if report.jobs.is_empty() {
                    println!("  {}", style("no jobs").dim());
                }
                for job in &report.jobs {
                    println!(
                        "  {} {} @ {} [{}]",
                        output::job_status_style(job.status).apply_to(format!("{:<11}", job.status.as_str())),
                        job.name,
                        short_revision(&job.revision),
                        style(&job.trigger).dim()
                    );
                }
                println!();

                println!("{}", style("Tasks").underlined());
                for status in [
                    TaskStatus::Pending,
                    TaskStatus::Running,
                    TaskStatus::Success,
                    TaskStatus::Failure,
                    TaskStatus::Mishap,
                ] {
                    let count = report.tasks_by_status.get(status.as_str()).copied().unwrap_or(0);
                    println!(
                        "  {} {}",
                        output::task_status_style(status).apply_to(format!("{:<8}", status.as_str())),
                        count
                    );
                }
                println!();
                println!("{}", output::key_value("Retries queued", &report.retry_queue.to_string()));
                println!(
                    "{}",
                    output::key_value("Unconfirmed dispatches", &report.outstanding_dispatches.to_string())
                );
                println!(
                    "{}",
                    output::key_value("Periodic triggers queued", &report.queued_periodic.to_string())
                );
            }
        }

        Ok(())
    }
}

fn short_revision(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_core::{Commit, Job, JobTrigger, Task, TaskKey};

    #[test]
    fn test_report_counts() {
        let mut snapshot = StoreSnapshot::default();
        let mut deps = BTreeMap::new();
        deps.insert("build".to_string(), Vec::new());
        let commit = Commit::new("repo", "0123456789abcdef", Utc::now());

        let active = Job::new("ci", &commit, JobTrigger::AnyCommit, 1.0, deps.clone(), Utc::now());
        let mut archived = Job::new("old", &commit, JobTrigger::Manual, 1.0, deps, Utc::now());
        archived.finished = Some(Utc::now());
        snapshot.jobs.insert(active.id.clone(), active);
        snapshot.jobs.insert(archived.id.clone(), archived);

        let task = Task::new("t1", TaskKey::new("repo", "abc", "build"), Utc::now(), 0, 1);
        snapshot.tasks.insert(task.id.clone(), task);

        let report = StatusReport::from_snapshot(&snapshot, false);
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(report.jobs[0].status, JobStatus::InProgress);
        assert_eq!(report.tasks_by_status.get("PENDING"), Some(&1));

        let report = StatusReport::from_snapshot(&snapshot, true);
        assert_eq!(report.jobs.len(), 2);
    }

    #[test]
    fn test_short_revision() {
        assert_eq!(short_revision("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_revision("abc"), "abc");
    }
}
