//! Task executor trait

use std::sync::Arc;

use kiln_core::Machine;

use crate::error::Result;
use crate::types::{TaskRequest, TaskResult};

/// Trait for remote execution backends
///
/// Implementations translate between kiln's task vocabulary and a fleet's
/// wire format. Every call is fallible; none of them retries internally.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Machines in `pool` that are alive, not quarantined and idle
    async fn get_free_machines(&self, pool: &str) -> Result<Vec<Machine>>;

    /// Every live machine in `pool`, busy or not
    async fn get_machines(&self, pool: &str) -> Result<Vec<Machine>>;

    /// PENDING tasks in `pool`.
    ///
    /// The search is bounded to the backend's configured lookback window.
    async fn get_pending_tasks(&self, pool: &str) -> Result<Vec<TaskResult>>;

    /// RUNNING tasks in `pool`, bounded like [`Self::get_pending_tasks`]
    async fn get_running_tasks(&self, pool: &str) -> Result<Vec<TaskResult>>;

    /// Look up a single task
    async fn get_task_result(&self, id: &str) -> Result<TaskResult>;

    /// Whether each task has reached a terminal state, in input order
    async fn get_task_completion_statuses(&self, ids: &[String]) -> Result<Vec<bool>>;

    /// Trigger a task.
    ///
    /// Returns a PENDING result, or a SUCCESS result with `deduped_from` set
    /// when the backend served a cached result.
    async fn trigger_task(&self, req: &TaskRequest) -> Result<TaskResult>;
}

#[async_trait::async_trait]
impl<T: TaskExecutor + ?Sized> TaskExecutor for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get_free_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        (**self).get_free_machines(pool).await
    }

    async fn get_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        (**self).get_machines(pool).await
    }

    async fn get_pending_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        (**self).get_pending_tasks(pool).await
    }

    async fn get_running_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        (**self).get_running_tasks(pool).await
    }

    async fn get_task_result(&self, id: &str) -> Result<TaskResult> {
        (**self).get_task_result(id).await
    }

    async fn get_task_completion_statuses(&self, ids: &[String]) -> Result<Vec<bool>> {
        (**self).get_task_completion_statuses(ids).await
    }

    async fn trigger_task(&self, req: &TaskRequest) -> Result<TaskResult> {
        (**self).trigger_task(req).await
    }
}
