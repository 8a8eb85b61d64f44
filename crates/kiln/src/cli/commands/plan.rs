//! Plan command

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use console::style;
use tracing::info;

use kiln_core::config::{load_config_or_default, Config};
use kiln_scheduler::{Candidate, ReporterRegistry, Scheduler, StaticSource, Workload};

use crate::cli::{engine, output, Cli, OutputFormat};

/// Show scored candidates without dispatching
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Workload file with commits, task specs and job specs
    #[arg(short, long, default_value = "workload.yaml")]
    pub workload: PathBuf,

    /// Show at most this many candidates
    #[arg(short, long)]
    pub limit: Option<usize>,
}

impl PlanCommand {
    /// Execute the plan command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(workload = %self.workload.display(), "executing plan command");
        let cwd = std::env::current_dir()?;
        let (config, _) = load_config_or_default(&cwd);
        let workload = engine::load_workload(&self.workload)?;

        let mut candidates = plan(&config, workload).await?;
        if let Some(limit) = self.limit {
            candidates.truncate(limit);
        }

        match cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&candidates)?);
            }
            OutputFormat::Text => {
                if candidates.is_empty() {
                    output::info("Nothing to schedule");
                    return Ok(());
                }
                println!("{}", output::header("Candidates"));
                println!();
                for (rank, candidate) in candidates.iter().enumerate() {
                    let retry = match &candidate.retry_of {
                        Some(failed) => format!(" retry of {}", failed),
                        None => String::new(),
                    };
                    println!(
                        "  {:>3}. {} {} attempt {}{} ({} job(s))",
                        rank + 1,
                        style(format!("{:>8.3}", candidate.score)).bold(),
                        output::key_style().apply_to(&candidate.key),
                        candidate.attempt,
                        retry,
                        candidate.job_ids.len()
                    );
                }
            }
        }

        Ok(())
    }
}

/// Score a workload against the saved state without touching the backend
/// or writing the state file
async fn plan(config: &Config, workload: Workload) -> anyhow::Result<Vec<Candidate>> {
    let snapshot = engine::open_store(config)?.snapshot().await;
    let store = Arc::new(kiln_scheduler::TaskStore::from_snapshot(snapshot));
    let executor = Arc::new(engine::memory_executor(config, &workload)?);
    let source = Arc::new(StaticSource::new(workload));

    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        executor,
        store,
        source.clone(),
        source,
        Arc::new(ReporterRegistry::empty()),
    );
    Ok(scheduler.plan().await?)
}
