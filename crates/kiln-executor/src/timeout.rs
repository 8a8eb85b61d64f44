//! Wall-clock bound on trigger calls

use std::sync::Arc;
use std::time::Duration;

use kiln_core::Machine;
use tracing::warn;

use crate::error::{ExecutorError, Result};
use crate::traits::TaskExecutor;
use crate::types::{TaskRequest, TaskResult, DEFAULT_TRIGGER_TIMEOUT};

/// Wraps an executor so that `trigger_task` fails with
/// [`ExecutorError::Timeout`] once `timeout` elapses.
///
/// The backend call runs on its own task and is never cancelled: a trigger
/// that outlives the bound still lands, and the scheduler can attribute its
/// task later. A timed out call is not retried here.
pub struct TimeoutExecutor<E> {
    inner: Arc<E>,
    timeout: Duration,
}

impl<E: TaskExecutor + 'static> TimeoutExecutor<E> {
    pub fn new(inner: E, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }

    /// Wrap with the default 60 second bound
    pub fn with_default_timeout(inner: E) -> Self {
        Self::new(inner, DEFAULT_TRIGGER_TIMEOUT)
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait::async_trait]
impl<E: TaskExecutor + 'static> TaskExecutor for TimeoutExecutor<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_free_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        self.inner.get_free_machines(pool).await
    }

    async fn get_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        self.inner.get_machines(pool).await
    }

    async fn get_pending_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        self.inner.get_pending_tasks(pool).await
    }

    async fn get_running_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        self.inner.get_running_tasks(pool).await
    }

    async fn get_task_result(&self, id: &str) -> Result<TaskResult> {
        self.inner.get_task_result(id).await
    }

    async fn get_task_completion_statuses(&self, ids: &[String]) -> Result<Vec<bool>> {
        self.inner.get_task_completion_statuses(ids).await
    }

    async fn trigger_task(&self, req: &TaskRequest) -> Result<TaskResult> {
        let inner = self.inner.clone();
        let request = req.clone();
        let call = tokio::spawn(async move { inner.trigger_task(&request).await });

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ExecutorError::Other(format!(
                "trigger of {} aborted: {}",
                req.key, e
            ))),
            Err(_) => {
                warn!(
                    task = %req.key,
                    timeout_secs = self.timeout.as_secs(),
                    "trigger call timed out, leaving it to finish in the background"
                );
                Err(ExecutorError::Timeout(format!(
                    "trigger of {} exceeded {:?}",
                    req.key, self.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryExecutor;
    use kiln_core::{Dimension, TaskKey, TaskSpec};

    fn request() -> TaskRequest {
        let spec = TaskSpec {
            command: vec!["run".to_string()],
            ..Default::default()
        };
        TaskRequest::from_spec(&spec, TaskKey::new("repo", "abc", "test"), 0, "ci").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_times_out() {
        let backend = Arc::new(InMemoryExecutor::new());
        backend.add_machine(Machine::new("bot-1", &[Dimension::new("pool", "ci")]));
        backend.set_trigger_latency(Some(Duration::from_secs(120)));

        let executor = TimeoutExecutor::new(backend.clone(), Duration::from_secs(60));
        let err = executor.trigger_task(&request()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_within_bound() {
        let backend = Arc::new(InMemoryExecutor::new());
        backend.set_trigger_latency(Some(Duration::from_secs(5)));

        let executor = TimeoutExecutor::with_default_timeout(backend.clone());
        let result = executor.trigger_task(&request()).await.unwrap();
        assert_eq!(result.status, kiln_core::TaskStatus::Pending);
        assert_eq!(backend.trigger_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_trigger_still_lands() {
        let backend = Arc::new(InMemoryExecutor::new());
        backend.set_trigger_latency(Some(Duration::from_secs(90)));

        let executor = TimeoutExecutor::new(backend.clone(), Duration::from_secs(60));
        let req = request();
        let err = executor.trigger_task(&req).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
        assert!(backend.task_ids().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.trigger_calls().len(), 1);
        let ids = backend.task_ids();
        assert_eq!(ids.len(), 1);

        let pending = executor.get_pending_tasks("ci").await.unwrap();
        assert_eq!(pending[0].id, ids[0]);
        assert_eq!(
            pending[0].tags.correlation_id.as_deref(),
            Some(req.correlation_id.as_str())
        );
    }
}
