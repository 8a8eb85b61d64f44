//! Builds the scheduler's collaborators from configuration

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use kiln_core::config::Config;
use kiln_executor::{AutoRun, InMemoryExecutor, SwarmingExecutor, TaskExecutor};
use kiln_scheduler::{TaskStore, Workload};
use tracing::{info, warn};

/// Open the configured state file, or an unpersisted store
pub fn open_store(config: &Config) -> anyhow::Result<TaskStore> {
    match &config.scheduler.state_file {
        Some(path) => TaskStore::open(path)
            .with_context(|| format!("Failed to open state file {}", path.display())),
        None => Ok(TaskStore::new()),
    }
}

/// Load a workload file
pub fn load_workload(path: &Path) -> anyhow::Result<Workload> {
    Workload::load(path).with_context(|| format!("Failed to load workload {}", path.display()))
}

/// Create the configured backend.
///
/// The in-memory backend is seeded with the workload's machines.
pub fn build_executor(config: &Config, workload: &Workload) -> anyhow::Result<Arc<dyn TaskExecutor>> {
    match config.executor.backend.as_str() {
        "memory" => Ok(Arc::new(memory_executor(config, workload)?)),
        "swarming" => {
            let executor = SwarmingExecutor::from_executor_config(&config.executor)
                .context("Failed to create swarming backend")?;
            if !executor.is_authenticated() {
                warn!(
                    env = %config.executor.auth_token_env,
                    "no swarming token set, requests are unauthenticated"
                );
            }
            Ok(Arc::new(executor))
        }
        other => anyhow::bail!("Unknown executor backend '{}'", other),
    }
}

/// In-memory backend seeded with the workload's machines, running tasks on
/// its own when `executor.memory.auto_run` is set
pub fn memory_executor(config: &Config, workload: &Workload) -> anyhow::Result<InMemoryExecutor> {
    let mut executor = InMemoryExecutor::with_lookback(config.executor.pending_lookback());
    let memory = &config.executor.memory;
    if memory.auto_run {
        info!(run_secs = memory.run_secs, outcome = %memory.outcome, "in-memory tasks run on their own");
        executor = executor.with_auto_run(AutoRun {
            run_for: memory.run_time(),
            outcome: memory.outcome,
        });
    }
    let fleet = workload.fleet().context("Invalid machine in workload")?;
    info!(machines = fleet.len(), "seeding in-memory fleet");
    for machine in fleet {
        executor.add_machine(machine);
    }
    Ok(executor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Dimension, TaskKey, TaskSpec, TaskStatus};
    use kiln_executor::TaskRequest;

    #[tokio::test]
    async fn test_memory_executor_is_seeded() {
        let mut workload = Workload::default();
        workload.machines.insert(
            "bot-1".to_string(),
            vec!["pool:default".to_string(), "os:Linux".to_string()],
        );
        let config = Config::default();

        let executor = memory_executor(&config, &workload).unwrap();
        let free = executor.get_free_machines("default").await.unwrap();
        assert_eq!(free.len(), 1);
        assert!(free[0].satisfies(&[Dimension::new("os", "Linux")]));
    }

    #[tokio::test]
    async fn test_memory_executor_runs_tasks_to_configured_outcome() {
        let mut workload = Workload::default();
        workload
            .machines
            .insert("bot-1".to_string(), vec!["pool:default".to_string()]);
        let mut config = Config::default();
        config.executor.memory.run_secs = 0;
        config.executor.memory.outcome = TaskStatus::Mishap;

        let executor = memory_executor(&config, &workload).unwrap();
        let spec = TaskSpec {
            command: vec!["run".to_string()],
            ..Default::default()
        };
        let req =
            TaskRequest::from_spec(&spec, TaskKey::new("repo", "abc", "build"), 0, "default").unwrap();
        let task = executor.trigger_task(&req).await.unwrap();

        // First look starts it, the next one finds it finished
        let started = executor.get_task_result(&task.id).await.unwrap();
        assert_eq!(started.status, TaskStatus::Running);
        let finished = executor.get_task_result(&task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Mishap);
    }

    #[tokio::test]
    async fn test_memory_executor_without_auto_run_waits() {
        let mut workload = Workload::default();
        workload
            .machines
            .insert("bot-1".to_string(), vec!["pool:default".to_string()]);
        let mut config = Config::default();
        config.executor.memory.auto_run = false;

        let executor = memory_executor(&config, &workload).unwrap();
        let spec = TaskSpec {
            command: vec!["run".to_string()],
            ..Default::default()
        };
        let req =
            TaskRequest::from_spec(&spec, TaskKey::new("repo", "abc", "build"), 0, "default").unwrap();
        let task = executor.trigger_task(&req).await.unwrap();
        let result = executor.get_task_result(&task.id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Pending);
    }

    #[test]
    fn test_unknown_backend() {
        let mut config = Config::default();
        config.executor.backend = "carrier-pigeon".to_string();
        assert!(build_executor(&config, &Workload::default()).is_err());
    }

    #[test]
    fn test_store_without_state_file() {
        let mut config = Config::default();
        config.scheduler.state_file = None;
        assert!(open_store(&config).unwrap().path().is_none());
    }
}
