//! Flakes command

use chrono::{DateTime, Duration, Utc};
use clap::Args;
use console::style;
use tracing::info;

use kiln_core::config::load_config_or_default;
use kiln_core::Task;
use kiln_scheduler::{finished_since, flake_reports, FlakeReport};

use crate::cli::{engine, output, Cli, OutputFormat};

/// Report flaky tasks from the state file
#[derive(Debug, Args)]
pub struct FlakesCommand {
    /// Look back this many days (defaults to flakes.window_days)
    #[arg(short, long)]
    pub days: Option<u64>,
}

impl FlakesCommand {
    /// Execute the flakes command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let (config, _) = load_config_or_default(&cwd);
        let days = self.days.unwrap_or(config.flakes.window_days);
        info!(days, "executing flakes command");

        let store = engine::open_store(&config)?;
        let since = Utc::now() - Duration::days(i64::try_from(days)?);
        let reports = flaky_reports(&store.tasks().await, since);

        match cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
            OutputFormat::Text => {
                if reports.is_empty() {
                    output::success(&format!("No flaky tasks in the last {} day(s)", days));
                    return Ok(());
                }
                println!(
                    "{}",
                    output::header(&format!("Flaky tasks in the last {} day(s)", days))
                );
                println!();
                for report in &reports {
                    println!(
                        "  {} {} ok, {} failed, {} mishap",
                        output::key_style().apply_to(&report.key),
                        style(report.successes).green(),
                        style(report.failures).red(),
                        style(report.mishaps).yellow()
                    );
                    for id in &report.flaky {
                        println!("      {}", style(id).dim());
                    }
                }
            }
        }

        Ok(())
    }
}

fn flaky_reports(tasks: &[Task], since: DateTime<Utc>) -> Vec<FlakeReport> {
    flake_reports(&finished_since(tasks, since))
        .into_iter()
        .filter(FlakeReport::is_flaky)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{TaskKey, TaskStatus, TaskUpdate};

    fn finished(id: &str, name: &str, attempt: u32, status: TaskStatus, at: DateTime<Utc>) -> Task {
        let mut task = Task::new(id, TaskKey::new("repo", "abc", name), at, attempt, 2);
        task.apply(&TaskUpdate {
            started: Some(at),
            finished: Some(at),
            ..TaskUpdate::status(status)
        })
        .unwrap();
        task
    }

    #[test]
    fn test_only_recent_flakes_reported() {
        let now = Utc::now();
        let old = now - Duration::days(30);
        let tasks = vec![
            finished("t1", "build", 0, TaskStatus::Failure, now),
            finished("t2", "build", 1, TaskStatus::Success, now),
            finished("t3", "lint", 0, TaskStatus::Success, now),
            finished("t4", "test", 0, TaskStatus::Mishap, old),
        ];

        let reports = flaky_reports(&tasks, now - Duration::days(7));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].key.name, "build");
        assert_eq!(reports[0].flaky, vec!["t1".to_string()]);
    }
}
