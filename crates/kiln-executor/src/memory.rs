//! In-memory execution backend
//!
//! [`InMemoryExecutor`] owns a simulated fleet: machines, triggered tasks and
//! a dedup cache for idempotent requests. It backs local runs and tests.
//!
//! ## Behavior
//!
//! - A triggered task claims a free machine that satisfies its dimensions
//!   (if any) but stays PENDING until [`InMemoryExecutor::start_task`].
//! - Completion is scripted through [`InMemoryExecutor::complete_task`].
//! - With an [`AutoRun`] set, every query first moves tasks along on its
//!   own: PENDING tasks start once a machine is theirs, RUNNING tasks finish
//!   with the configured outcome after `run_for`.
//! - Every trigger call that passes validation is recorded, and so is the
//!   window of every pending-task query.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::{Machine, TaskStatus};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ExecutorError, Result};
use crate::traits::TaskExecutor;
use crate::types::{PendingWindow, TaskRequest, TaskResult, DEFAULT_PENDING_LOOKBACK};
use crate::validation::validate_request;

/// Lets the fleet run tasks without a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoRun {
    /// Time between a task starting and finishing
    pub run_for: Duration,
    /// Status every task finishes with
    pub outcome: TaskStatus,
}

#[derive(Debug, Clone)]
struct StoredTask {
    /// Trigger order
    seq: u64,
    request: TaskRequest,
    result: TaskResult,
}

#[derive(Debug, Default)]
struct FleetState {
    machines: BTreeMap<String, Machine>,
    tasks: BTreeMap<String, StoredTask>,
    /// Dedup key -> id of the task whose result is reused
    dedup: HashMap<String, String>,
    auto_run: Option<AutoRun>,
    no_capacity: bool,
    trigger_latency: Option<Duration>,
    trigger_calls: Vec<TaskRequest>,
    pending_windows: Vec<PendingWindow>,
}

impl FleetState {
    fn stored(&self, id: &str) -> Result<&StoredTask> {
        self.tasks
            .get(id)
            .ok_or_else(|| ExecutorError::NotFound(id.to_string()))
    }

    fn stored_mut(&mut self, id: &str) -> Result<&mut StoredTask> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| ExecutorError::NotFound(id.to_string()))
    }

    fn release_machine(&mut self, task_id: &str) -> Option<String> {
        let machine = self
            .machines
            .values_mut()
            .find(|m| m.current_task_id.as_deref() == Some(task_id))?;
        machine.current_task_id = None;
        Some(machine.id.clone())
    }

    fn claimed_machine(&self, task_id: &str) -> Option<String> {
        self.machines
            .values()
            .find(|m| m.current_task_id.as_deref() == Some(task_id))
            .map(|m| m.id.clone())
    }

    /// The task's machine, claiming a free one if it has none yet
    fn claim_machine(&mut self, task_id: &str) -> Option<String> {
        if let Some(claimed) = self.claimed_machine(task_id) {
            return Some(claimed);
        }
        let dimensions = self.tasks.get(task_id)?.request.dimensions.clone();
        let free = self
            .machines
            .values_mut()
            .find(|m| m.is_free() && m.satisfies(&dimensions))?;
        free.current_task_id = Some(task_id.to_string());
        Some(free.id.clone())
    }

    fn start(&mut self, id: &str, now: DateTime<Utc>) -> Result<TaskResult> {
        let status = self.stored(id)?.result.status;
        if status != TaskStatus::Pending {
            return Err(ExecutorError::Other(format!(
                "task {} is {}, not PENDING",
                id, status
            )));
        }

        let machine_id = self.claim_machine(id);
        let task = self.stored_mut(id)?;
        task.result.status = TaskStatus::Running;
        task.result.started = Some(now);
        task.result.machine_id = machine_id;
        debug!(task_id = id, "memory task started");
        Ok(task.result.clone())
    }

    fn complete(&mut self, id: &str, status: TaskStatus, now: DateTime<Utc>) -> Result<TaskResult> {
        if !status.is_terminal() {
            return Err(ExecutorError::Other(format!(
                "{} is not a terminal status",
                status
            )));
        }

        let stored = self.stored(id)?.clone();
        if stored.result.status.is_terminal() {
            return Ok(stored.result);
        }

        let machine_id = self.release_machine(id);
        if status == TaskStatus::Success && stored.request.idempotent {
            self.dedup
                .insert(stored.request.dedup_key(), id.to_string());
        }

        let task = self.stored_mut(id)?;
        task.result.status = status;
        task.result.finished = Some(now);
        if task.result.machine_id.is_none() {
            task.result.machine_id = machine_id;
        }
        if status == TaskStatus::Success && !task.request.outputs.is_empty() {
            task.result.cas_output = Some(format!("{}/0", task.request.dedup_key()));
        }
        debug!(task_id = id, status = %status, "memory task completed");
        Ok(task.result.clone())
    }

    /// Finish tasks that ran long enough, then start waiting tasks that
    /// can get a machine, oldest first. A task never starts and finishes in
    /// the same pass.
    fn advance(&mut self, now: DateTime<Utc>) {
        let Some(auto) = self.auto_run else {
            return;
        };
        let run_for = chrono::Duration::from_std(auto.run_for)
            .unwrap_or_else(|_| chrono::Duration::days(1));

        let due: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.result.status == TaskStatus::Running)
            .filter(|(_, t)| t.result.started.is_some_and(|s| now - s >= run_for))
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            if let Err(e) = self.complete(&id, auto.outcome, now) {
                warn!(task_id = %id, error = %e, "auto-run failed to finish task");
            }
        }

        let mut waiting: Vec<(u64, String)> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.result.status == TaskStatus::Pending)
            .map(|(id, t)| (t.seq, id.clone()))
            .collect();
        waiting.sort();
        for (_, id) in waiting {
            if self.claim_machine(&id).is_none() {
                continue;
            }
            if let Err(e) = self.start(&id, now) {
                warn!(task_id = %id, error = %e, "auto-run failed to start task");
            }
        }
    }

    /// Unfinished tasks in `status` for `pool` created inside `window`
    fn listed(&self, status: TaskStatus, pool: &str, window: &PendingWindow) -> Vec<TaskResult> {
        self.tasks
            .values()
            .filter(|t| t.result.status == status)
            .filter(|t| t.request.pool() == Some(pool))
            .filter(|t| window.contains(t.result.created))
            .map(|t| t.result.clone())
            .collect()
    }
}

/// In-memory fleet for tests and local runs
#[derive(Debug)]
pub struct InMemoryExecutor {
    name: String,
    lookback: Duration,
    state: RwLock<FleetState>,
}

impl Default for InMemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn in_pool(machine: &Machine, pool: &str) -> bool {
    machine
        .dimensions
        .get("pool")
        .is_some_and(|pools| pools.iter().any(|p| p == pool))
}

impl InMemoryExecutor {
    /// Create an empty fleet with the default pending-query lookback
    pub fn new() -> Self {
        Self::with_lookback(DEFAULT_PENDING_LOOKBACK)
    }

    pub fn with_lookback(lookback: Duration) -> Self {
        Self {
            name: "memory".to_string(),
            lookback,
            state: RwLock::new(FleetState::default()),
        }
    }

    /// Run tasks without `start_task`/`complete_task` calls
    pub fn with_auto_run(self, auto_run: AutoRun) -> Self {
        self.write().auto_run = Some(auto_run);
        self
    }

    // A poisoned lock only means a test thread panicked mid-update; the
    // simulated fleet is still usable.
    fn read(&self) -> RwLockReadGuard<'_, FleetState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FleetState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access with auto-run progress applied
    fn advanced(&self) -> RwLockWriteGuard<'_, FleetState> {
        let mut state = self.write();
        state.advance(Utc::now());
        state
    }

    /// Add or replace a machine
    pub fn add_machine(&self, machine: Machine) {
        self.write().machines.insert(machine.id.clone(), machine);
    }

    /// Make every trigger call fail with `NoCapacity`
    pub fn set_no_capacity(&self, no_capacity: bool) {
        self.write().no_capacity = no_capacity;
    }

    /// Delay every trigger call by `latency`
    pub fn set_trigger_latency(&self, latency: Option<Duration>) {
        self.write().trigger_latency = latency;
    }

    /// Every request that reached the backend, in call order
    pub fn trigger_calls(&self) -> Vec<TaskRequest> {
        self.read().trigger_calls.clone()
    }

    /// Windows used by pending-task queries, in call order
    pub fn pending_windows(&self) -> Vec<PendingWindow> {
        self.read().pending_windows.clone()
    }

    /// Ids of every task the fleet knows about
    pub fn task_ids(&self) -> Vec<String> {
        self.read().tasks.keys().cloned().collect()
    }

    /// Move a task to RUNNING on its claimed machine
    pub fn start_task(&self, id: &str) -> Result<TaskResult> {
        self.write().start(id, Utc::now())
    }

    /// Finish a task with a terminal status and free its machine
    pub fn complete_task(&self, id: &str, status: TaskStatus) -> Result<TaskResult> {
        self.write().complete(id, status, Utc::now())
    }
}

#[async_trait]
impl TaskExecutor for InMemoryExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_free_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        Ok(self
            .advanced()
            .machines
            .values()
            .filter(|m| m.is_free() && in_pool(m, pool))
            .cloned()
            .collect())
    }

    async fn get_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        Ok(self
            .read()
            .machines
            .values()
            .filter(|m| !m.is_dead && in_pool(m, pool))
            .cloned()
            .collect())
    }

    async fn get_pending_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        let window = PendingWindow::ending_now(self.lookback);
        let mut state = self.advanced();
        state.pending_windows.push(window);
        Ok(state.listed(TaskStatus::Pending, pool, &window))
    }

    async fn get_running_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        let window = PendingWindow::ending_now(self.lookback);
        Ok(self.advanced().listed(TaskStatus::Running, pool, &window))
    }

    async fn get_task_result(&self, id: &str) -> Result<TaskResult> {
        Ok(self.advanced().stored(id)?.result.clone())
    }

    async fn get_task_completion_statuses(&self, ids: &[String]) -> Result<Vec<bool>> {
        let state = self.advanced();
        ids.iter()
            .map(|id| Ok(state.stored(id)?.result.status.is_terminal()))
            .collect()
    }

    async fn trigger_task(&self, req: &TaskRequest) -> Result<TaskResult> {
        validate_request(req)?;

        let latency = self.read().trigger_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.write();
        state.trigger_calls.push(req.clone());

        if state.no_capacity {
            return Err(ExecutorError::NoCapacity(format!(
                "no capacity in pool {}",
                req.pool().unwrap_or_default()
            )));
        }

        // Unique across processes: the scheduler's store outlives the fleet
        let id = format!("mem-{}", Uuid::new_v4().simple());
        let now = Utc::now();

        let cached = if req.idempotent {
            state.dedup.get(&req.dedup_key()).cloned()
        } else {
            None
        };

        let result = match cached {
            Some(original) => {
                debug!(task_id = %id, deduped_from = %original, "served cached result");
                let cas_output = state
                    .tasks
                    .get(&original)
                    .and_then(|t| t.result.cas_output.clone());
                TaskResult {
                    id: id.clone(),
                    name: req.name.clone(),
                    status: TaskStatus::Success,
                    created: now,
                    started: None,
                    finished: Some(now),
                    machine_id: None,
                    cas_output,
                    deduped_from: Some(original),
                    tags: req.tags(),
                }
            }
            None => {
                if let Some(machine) = state
                    .machines
                    .values_mut()
                    .find(|m| m.is_free() && m.satisfies(&req.dimensions))
                {
                    machine.current_task_id = Some(id.clone());
                }
                TaskResult {
                    id: id.clone(),
                    name: req.name.clone(),
                    status: TaskStatus::Pending,
                    created: now,
                    started: None,
                    finished: None,
                    machine_id: None,
                    cas_output: None,
                    deduped_from: None,
                    tags: req.tags(),
                }
            }
        };

        let seq = state.trigger_calls.len() as u64;
        state.tasks.insert(
            id,
            StoredTask {
                seq,
                request: req.clone(),
                result: result.clone(),
            },
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Dimension, TaskKey, TaskSpec};

    fn request(name: &str, idempotent: bool) -> TaskRequest {
        let spec = TaskSpec {
            dimensions: vec!["os:Linux".to_string()],
            command: vec!["run".to_string(), name.to_string()],
            idempotent,
            ..Default::default()
        };
        TaskRequest::from_spec(&spec, TaskKey::new("repo", "abc", name), 0, "ci").unwrap()
    }

    fn linux_bot(id: &str) -> Machine {
        Machine::new(
            id,
            &[Dimension::new("pool", "ci"), Dimension::new("os", "Linux")],
        )
    }

    #[tokio::test]
    async fn test_trigger_claims_free_machine() {
        let executor = InMemoryExecutor::new();
        executor.add_machine(linux_bot("bot-1"));

        let result = executor.trigger_task(&request("a", false)).await.unwrap();
        assert_eq!(result.status, TaskStatus::Pending);
        assert!(executor.get_free_machines("ci").await.unwrap().is_empty());
        assert_eq!(executor.get_machines("ci").await.unwrap().len(), 1);

        let running = executor.start_task(&result.id).unwrap();
        assert_eq!(running.machine_id.as_deref(), Some("bot-1"));

        executor.complete_task(&result.id, TaskStatus::Failure).unwrap();
        assert_eq!(executor.get_free_machines("ci").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_happens_before_backend_call() {
        let executor = InMemoryExecutor::new();
        let mut req = request("a", false);
        req.dimensions.push(Dimension::new("os", "Mac"));

        let err = executor.trigger_task(&req).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Validation(_)));
        assert!(executor.trigger_calls().is_empty());
        assert!(executor.task_ids().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_dedup() {
        let executor = InMemoryExecutor::new();
        let first = executor.trigger_task(&request("a", true)).await.unwrap();
        executor.complete_task(&first.id, TaskStatus::Success).unwrap();

        let second = executor.trigger_task(&request("a", true)).await.unwrap();
        assert_eq!(second.status, TaskStatus::Success);
        assert_eq!(second.deduped_from.as_deref(), Some(first.id.as_str()));
        assert!(second.finished.is_some());

        let not_idempotent = executor.trigger_task(&request("a", false)).await.unwrap();
        assert_eq!(not_idempotent.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_no_capacity() {
        let executor = InMemoryExecutor::new();
        executor.set_no_capacity(true);
        let err = executor.trigger_task(&request("a", false)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NoCapacity(_)));
        assert_eq!(executor.trigger_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_query_is_bounded() {
        let executor = InMemoryExecutor::with_lookback(Duration::from_secs(3600));
        let result = executor.trigger_task(&request("a", false)).await.unwrap();

        let pending = executor.get_pending_tasks("ci").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, result.id);
        assert!(executor.get_pending_tasks("other").await.unwrap().is_empty());

        let windows = executor.pending_windows();
        assert_eq!(windows.len(), 2);
        assert!(windows
            .iter()
            .all(|w| w.span() == chrono::Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_completion_statuses() {
        let executor = InMemoryExecutor::new();
        let a = executor.trigger_task(&request("a", false)).await.unwrap();
        let b = executor.trigger_task(&request("b", false)).await.unwrap();
        executor.complete_task(&b.id, TaskStatus::Mishap).unwrap();

        let statuses = executor
            .get_task_completion_statuses(&[a.id.clone(), b.id.clone()])
            .await
            .unwrap();
        assert_eq!(statuses, vec![false, true]);

        assert!(executor
            .get_task_completion_statuses(&["missing".to_string()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ids_are_unique_across_fleets() {
        // A restarted process gets a fresh fleet but keeps its old store
        let before = InMemoryExecutor::new();
        let after = InMemoryExecutor::new();
        let a = before.trigger_task(&request("a", false)).await.unwrap();
        let b = after.trigger_task(&request("a", false)).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("mem-"));
    }

    #[tokio::test]
    async fn test_running_tasks_listed_by_pool() {
        let executor = InMemoryExecutor::new();
        executor.add_machine(linux_bot("bot-1"));
        let running = executor.trigger_task(&request("a", false)).await.unwrap();
        let pending = executor.trigger_task(&request("b", false)).await.unwrap();
        executor.start_task(&running.id).unwrap();

        let listed = executor.get_running_tasks("ci").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, running.id);
        assert_eq!(listed[0].machine_id.as_deref(), Some("bot-1"));

        let waiting = executor.get_pending_tasks("ci").await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, pending.id);
        assert!(executor.get_running_tasks("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_run_finishes_tasks() {
        let executor = InMemoryExecutor::new().with_auto_run(AutoRun {
            run_for: Duration::ZERO,
            outcome: TaskStatus::Failure,
        });
        executor.add_machine(linux_bot("bot-1"));

        let first = executor.trigger_task(&request("a", false)).await.unwrap();
        let second = executor.trigger_task(&request("b", false)).await.unwrap();
        assert_eq!(first.status, TaskStatus::Pending);

        // One machine: the second task waits for the first to free it
        let statuses = executor
            .get_task_completion_statuses(&[first.id.clone(), second.id.clone()])
            .await
            .unwrap();
        assert_eq!(statuses, vec![false, false]);

        let done = executor.get_task_result(&first.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failure);
        assert_eq!(done.machine_id.as_deref(), Some("bot-1"));
        assert!(done.started.is_some() && done.finished.is_some());

        let later = executor.get_task_result(&second.id).await.unwrap();
        assert_eq!(later.status, TaskStatus::Failure);
        assert_eq!(executor.get_free_machines("ci").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_run_waits_for_run_time() {
        let executor = InMemoryExecutor::new().with_auto_run(AutoRun {
            run_for: Duration::from_secs(3600),
            outcome: TaskStatus::Success,
        });
        executor.add_machine(linux_bot("bot-1"));
        let task = executor.trigger_task(&request("a", false)).await.unwrap();

        let result = executor.get_task_result(&task.id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Running);
        assert!(result.started.is_some());
        assert_eq!(
            executor.get_task_completion_statuses(&[task.id]).await.unwrap(),
            vec![false]
        );
    }

    #[tokio::test]
    async fn test_auto_run_needs_a_machine() {
        let executor = InMemoryExecutor::new().with_auto_run(AutoRun {
            run_for: Duration::ZERO,
            outcome: TaskStatus::Success,
        });
        let task = executor.trigger_task(&request("a", false)).await.unwrap();
        let result = executor.get_task_result(&task.id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Pending);
    }
}
