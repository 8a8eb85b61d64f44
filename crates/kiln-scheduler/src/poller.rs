//! Completion polling for backends without push notifications

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_executor::TaskExecutor;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::completion::CompletionPayload;
use crate::error::Result;
use crate::store::TaskStore;
use crate::transport::Publisher;

/// Task ids per completion-status query
pub const POLL_BATCH_SIZE: usize = 100;

/// How long a published completion may go unprocessed before it is
/// published again
pub const DEFAULT_REPUBLISH_AFTER: Duration = Duration::from_secs(60);

/// Publishes a completion notification for every outstanding task the
/// backend reports finished.
///
/// A task still outstanding in the store `republish_after` its last
/// notification gets another one, so a message the transport gave up on is
/// not the end of the task.
pub struct CompletionPoller {
    executor: Arc<dyn TaskExecutor>,
    store: Arc<TaskStore>,
    publisher: Arc<dyn Publisher>,
    interval: Duration,
    republish_after: Duration,
    /// Ids not yet seen terminal in the store -> when they were last published
    published: Mutex<HashMap<String, Instant>>,
}

impl CompletionPoller {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        store: Arc<TaskStore>,
        publisher: Arc<dyn Publisher>,
        interval: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            publisher,
            interval,
            republish_after: DEFAULT_REPUBLISH_AFTER,
            published: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_republish_after(mut self, republish_after: Duration) -> Self {
        self.republish_after = republish_after;
        self
    }

    /// Check outstanding tasks once. Returns how many notifications were
    /// published.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<usize> {
        let now = Instant::now();
        let outstanding = self.store.outstanding_tasks().await;
        let mut published = self.published.lock().await;
        published.retain(|id, _| outstanding.iter().any(|t| t.id == *id));

        let waiting: Vec<_> = outstanding
            .iter()
            .filter(|t| match published.get(&t.id) {
                Some(at) => now.duration_since(*at) >= self.republish_after,
                None => true,
            })
            .collect();
        if waiting.is_empty() {
            return Ok(0);
        }

        let mut count = 0;
        for batch in waiting.chunks(POLL_BATCH_SIZE) {
            let ids: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
            let finished = self.executor.get_task_completion_statuses(&ids).await?;

            for (task, done) in batch.iter().zip(finished) {
                if !done {
                    continue;
                }
                let correlation_id = (!task.correlation_id.is_empty()).then(|| task.correlation_id.clone());
                let payload = CompletionPayload::new(&task.id, correlation_id);
                self.publisher
                    .publish(payload.to_bytes()?, HashMap::new())
                    .await?;
                if published.insert(task.id.clone(), now).is_some() {
                    warn!(task_id = %task.id, "completion still unprocessed, published again");
                }
                count += 1;
            }
        }

        if count > 0 {
            debug!(count, "published completions");
        }
        Ok(count)
    }

    /// Poll at the configured interval until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "completion poller started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(_) => {}
                        Err(e) if e.is_transient() => warn!(error = %e, "completion poll failed"),
                        Err(e) => error!(error = %e, "completion poll failed"),
                    }
                }
            }
        }

        info!("completion poller stopped");
    }
}
