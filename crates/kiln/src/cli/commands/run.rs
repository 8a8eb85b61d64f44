//! Run command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kiln_core::config::{load_config_or_default, Config};
use kiln_scheduler::{
    ChannelTransport, CompletionHandler, CompletionPoller, ReporterRegistry, Scheduler,
    StaticSource, TickSummary,
};

use crate::cli::{engine, output, Cli, OutputFormat};

/// Run the scheduling loop
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Workload file with commits, task specs and job specs
    #[arg(short, long, default_value = "workload.yaml")]
    pub workload: PathBuf,

    /// Run a single tick and exit
    #[arg(long)]
    pub once: bool,
}

impl RunCommand {
    /// Execute the run command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(workload = %self.workload.display(), once = self.once, "executing run command");
        let cwd = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&cwd);
        if config_path.is_none() && !cli.quiet {
            output::warning("No configuration found, using defaults");
        }

        check_backend(&config, self.once)?;

        let workload = engine::load_workload(&self.workload)?;
        let executor = engine::build_executor(&config, &workload)?;
        let store = Arc::new(engine::open_store(&config)?);
        let source = Arc::new(StaticSource::new(workload));

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            executor.clone(),
            store.clone(),
            source.clone(),
            source,
            Arc::new(ReporterRegistry::new()),
        );

        if self.once {
            let summary = scheduler.tick().await.context("Scheduler tick failed")?;
            print_summary(cli, &summary)?;
            return Ok(());
        }

        let transport = Arc::new(ChannelTransport::new(config.completion.redelivery_delay()));
        let subscription = transport
            .subscribe()
            .await
            .context("Completion subscription already taken")?;
        let handler = Arc::new(CompletionHandler::new(executor.clone(), store.clone()));
        let poller = CompletionPoller::new(
            executor,
            store.clone(),
            transport.clone(),
            config.completion.poll_interval(),
        )
        .with_republish_after(config.completion.republish_after());

        if !cli.quiet {
            output::info(&format!(
                "Scheduling over {} (press {} to stop)",
                output::path_style().apply_to(self.workload.display()),
                style("Ctrl-C").bold()
            ));
        }

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::join!(
            scheduler.run(shutdown.clone()),
            poller.run(shutdown.clone()),
            subscription.run(handler, config.completion.concurrency, shutdown.clone()),
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupt received, shutting down");
                        stop.cancel();
                    }
                    _ = stop.cancelled() => {}
                }
            },
        );

        store.save().await.context("Failed to save scheduler state")?;
        let stats = transport.stats();
        info!(
            published = stats.published,
            acked = stats.acked,
            nacked = stats.nacked,
            dropped = stats.dropped,
            "completion transport closed"
        );
        if !cli.quiet {
            output::success("Scheduler stopped");
        }
        Ok(())
    }
}

/// A continuous run needs a backend that finishes tasks
fn check_backend(config: &Config, once: bool) -> anyhow::Result<()> {
    if !once && config.executor.backend == "memory" && !config.executor.memory.auto_run {
        anyhow::bail!(
            "The in-memory backend never finishes tasks with executor.memory.auto_run off; \
             use --once or turn auto_run on"
        );
    }
    Ok(())
}

fn print_summary(cli: &Cli, summary: &TickSummary) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "jobs_admitted": summary.jobs_admitted,
                "candidates": summary.candidates,
                "dispatched": summary.dispatched,
                "failed": summary.failed,
                "stuck": summary.stuck,
                "jobs_finished": summary.jobs_finished,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            if cli.quiet {
                return Ok(());
            }
            println!("{}", output::header("Tick complete"));
            println!("{}", output::key_value("Jobs admitted", &summary.jobs_admitted.to_string()));
            println!("{}", output::key_value("Candidates", &summary.candidates.to_string()));
            println!("{}", output::key_value("Dispatched", &summary.dispatched.to_string()));
            if summary.failed > 0 {
                println!(
                    "{}",
                    output::key_value("Failed", &style(summary.failed).red().to_string())
                );
            }
            if summary.stuck > 0 {
                println!(
                    "{}",
                    output::key_value("Stuck", &style(summary.stuck).yellow().to_string())
                );
            }
            println!("{}", output::key_value("Jobs finished", &summary.jobs_finished.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_needs_auto_run_to_loop() {
        let mut config = Config::default();
        config.executor.backend = "memory".to_string();
        assert!(check_backend(&config, false).is_ok());

        config.executor.memory.auto_run = false;
        assert!(check_backend(&config, false).is_err());
        assert!(check_backend(&config, true).is_ok());
    }
}
