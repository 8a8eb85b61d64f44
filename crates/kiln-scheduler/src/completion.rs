//! Completion notifications
//!
//! The backend announces task state changes as messages carrying a
//! [`CompletionPayload`]. The handler looks up the authoritative result,
//! folds it into the store and acks; any error nacks the message so the
//! transport redelivers it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_executor::{TaskExecutor, TaskResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::store::{DispatchIntent, TaskStore};

/// Settles a delivered message
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// The message was handled; do not deliver it again
    async fn ack(self: Box<Self>);

    /// The message was not handled; deliver it again later
    async fn nack(self: Box<Self>);
}

/// A delivered notification
pub struct Message {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// 1 on first delivery
    pub delivery_attempt: u32,
    handle: Option<Box<dyn AckHandle>>,
}

impl Message {
    /// Create a message that is settled by nobody
    pub fn new(id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            data,
            attributes: HashMap::new(),
            delivery_attempt: 1,
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: Box<dyn AckHandle>) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt;
        self
    }

    pub async fn ack(self) {
        if let Some(handle) = self.handle {
            handle.ack().await;
        }
    }

    pub async fn nack(self) {
        if let Some(handle) = self.handle {
            handle.nack().await;
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("attributes", &self.attributes)
            .field("delivery_attempt", &self.delivery_attempt)
            .finish()
    }
}

/// Body of a completion notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionPayload {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CompletionPayload {
    pub fn new(task_id: impl Into<String>, correlation_id: Option<String>) -> Self {
        Self {
            task_id: task_id.into(),
            correlation_id,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let payload: Self = serde_json::from_slice(data)
            .map_err(|e| SchedulerError::Payload(format!("invalid completion payload: {}", e)))?;
        if payload.task_id.is_empty() {
            return Err(SchedulerError::Payload("completion payload has no task id".to_string()));
        }
        Ok(payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// What a processed notification did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// A known task changed state
    Updated { retry_queued: bool },
    /// A known task was already in the reported state
    Unchanged,
    /// The task was not known yet and was recorded from the result
    Created,
    /// The notification is not for a task this scheduler tracks
    Ignored,
}

/// Folds completion notifications into the store
pub struct CompletionHandler {
    executor: Arc<dyn TaskExecutor>,
    store: Arc<TaskStore>,
}

impl CompletionHandler {
    pub fn new(executor: Arc<dyn TaskExecutor>, store: Arc<TaskStore>) -> Self {
        Self { executor, store }
    }

    /// Process a message, then ack it on success or nack it on error
    #[instrument(skip(self, message), fields(message_id = %message.id, delivery = message.delivery_attempt))]
    pub async fn handle(&self, message: Message) -> Result<CompletionOutcome> {
        match self.process(&message.data).await {
            Ok(outcome) => {
                debug!(?outcome, "completion handled");
                message.ack().await;
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "completion failed, nacking");
                message.nack().await;
                Err(e)
            }
        }
    }

    /// Apply one notification body to the store
    pub async fn process(&self, data: &[u8]) -> Result<CompletionOutcome> {
        let payload = CompletionPayload::parse(data)?;

        if self.store.task(&payload.task_id).await.is_none() {
            if let Some(cid) = &payload.correlation_id {
                if self.store.intent(cid).await.is_some_and(|i| i.abandoned) {
                    debug!(task_id = %payload.task_id, correlation_id = %cid, "dispatch was abandoned, ignoring");
                    return Ok(CompletionOutcome::Ignored);
                }
            }
        }

        let result = self.executor.get_task_result(&payload.task_id).await?;

        if self.store.task(&result.id).await.is_some() {
            let Some(outcome) = self.store.update_task(&result.id, &result.update()).await? else {
                return Err(SchedulerError::Store(format!("task {} disappeared", result.id)));
            };
            if !outcome.changed {
                return Ok(CompletionOutcome::Unchanged);
            }
            info!(
                task_id = %result.id,
                key = %outcome.task.key,
                status = %outcome.task.status,
                retry_queued = outcome.retry_queued,
                "task updated"
            );
            return Ok(CompletionOutcome::Updated {
                retry_queued: outcome.retry_queued,
            });
        }

        self.record_unknown(&payload, &result).await
    }

    /// Record a task whose trigger response has not been seen
    async fn record_unknown(
        &self,
        payload: &CompletionPayload,
        result: &TaskResult,
    ) -> Result<CompletionOutcome> {
        let cid = payload
            .correlation_id
            .as_deref()
            .or(result.tags.correlation_id.as_deref());
        let intent: Option<DispatchIntent> = match cid {
            Some(cid) => self.store.intent(cid).await,
            None => None,
        };
        if intent.as_ref().is_some_and(|i| i.abandoned) {
            return Ok(CompletionOutcome::Ignored);
        }

        let tagged = match (&result.tags.key, result.tags.attempt, result.tags.max_attempts) {
            (Some(key), Some(attempt), Some(max_attempts)) => Some((key.clone(), attempt, max_attempts)),
            _ => None,
        };
        let (key, attempt, max_attempts) = match (tagged, &intent) {
            (Some(tagged), _) => tagged,
            (None, Some(intent)) => (intent.key.clone(), intent.attempt, intent.max_attempts),
            (None, None) => {
                debug!(task_id = %result.id, "untracked task, ignoring");
                return Ok(CompletionOutcome::Ignored);
            }
        };

        let mut task = result.to_task(key, attempt, max_attempts)?;
        if let Some(intent) = &intent {
            task.correlation_id = intent.correlation_id.clone();
            for job in &intent.job_ids {
                if !task.jobs.contains(job) {
                    task.jobs.push(job.clone());
                }
            }
            if task.retry_of.is_none() {
                task.retry_of = intent.retry_of.clone();
            }
        }

        let outcome = self.store.record_task(task).await?;
        if let Some(failed) = &outcome.task.retry_of {
            self.store.complete_retry(failed).await;
        }
        info!(
            task_id = %outcome.task.id,
            key = %outcome.task.key,
            status = %outcome.task.status,
            "task recorded from completion"
        );
        Ok(CompletionOutcome::Created)
    }
}
