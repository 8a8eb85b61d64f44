//! Task keys, attempts and status transitions

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobId;
use crate::error::ModelError;

/// Identity of a recurring unit of work
///
/// Two tasks with equal keys are attempts at the same logical unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    /// Repository URL or name
    pub repo: String,
    /// Commit hash the task runs at
    pub revision: String,
    /// Task spec name
    pub name: String,
    /// Set only for tasks of manually forced jobs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub forced_job_id: String,
}

impl TaskKey {
    /// Create a new task key
    pub fn new(
        repo: impl Into<String>,
        revision: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            name: name.into(),
            forced_job_id: String::new(),
        }
    }

    /// Attach the key to a forced job
    pub fn with_forced_job(mut self, job_id: impl Into<String>) -> Self {
        self.forced_job_id = job_id.into();
        self
    }

    /// Whether this key belongs to a forced job
    pub fn is_forced(&self) -> bool {
        !self.forced_job_id.is_empty()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.repo, self.revision, self.name)?;
        if self.is_forced() {
            write!(f, "#{}", self.forced_job_id)?;
        }
        Ok(())
    }
}

/// Status of a single task attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Triggered, waiting for a machine
    Pending,
    /// Running on a machine
    Running,
    /// Completed without failure
    Success,
    /// Completed with a failure attributable to the work itself
    Failure,
    /// The backend could not complete the task (bot died, expired, killed, ...)
    Mishap,
}

impl TaskStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Mishap)
    }

    /// Whether the status is a failed outcome that may be retried
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failure | Self::Mishap)
    }

    /// Returns the string representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Mishap => "MISHAP",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Success | Self::Failure | Self::Mishap => 2,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A state change reported for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub machine_id: Option<String>,
    pub cas_output: Option<String>,
    pub deduped_from: Option<String>,
}

impl TaskUpdate {
    /// Create an update carrying only a status
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            started: None,
            finished: None,
            machine_id: None,
            cas_output: None,
            deduped_from: None,
        }
    }
}

/// The projection of a task kept in a job slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
}

impl TaskSummary {
    /// Whether another attempt may follow this one
    pub fn attempts_remaining(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }
}

/// A single execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Backend-assigned identifier
    pub id: String,
    pub key: TaskKey,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    /// Zero-based attempt number for this key
    pub attempt: u32,
    /// Retry budget for the key
    pub max_attempts: u32,
    #[serde(default)]
    pub machine_id: Option<String>,
    /// Content-addressed output reference, opaque to the scheduler
    #[serde(default)]
    pub cas_output: Option<String>,
    /// Set when the backend returned a cached result instead of running
    #[serde(default)]
    pub deduped_from: Option<String>,
    /// Caller-supplied id sent with the trigger request
    #[serde(default)]
    pub correlation_id: String,
    /// Jobs this attempt belongs to
    #[serde(default)]
    pub jobs: Vec<JobId>,
    /// The attempt this one retries
    #[serde(default)]
    pub retry_of: Option<String>,
}

impl Task {
    /// Create a new pending attempt
    pub fn new(
        id: impl Into<String>,
        key: TaskKey,
        created: DateTime<Utc>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            key,
            status: TaskStatus::Pending,
            created,
            started: None,
            finished: None,
            attempt,
            max_attempts: max_attempts.max(1),
            machine_id: None,
            cas_output: None,
            deduped_from: None,
            correlation_id: String::new(),
            jobs: Vec::new(),
            retry_of: None,
        }
    }

    /// Whether the result was served from the backend's dedup cache
    pub fn is_deduped(&self) -> bool {
        self.deduped_from.as_deref().is_some_and(|d| !d.is_empty())
    }

    /// Whether another attempt may follow this one
    pub fn attempts_remaining(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }

    /// Summary stored in job slots
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            status: self.status,
        }
    }

    /// Check the timing invariants
    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |message: &str| ModelError::InvalidTiming {
            id: self.id.clone(),
            message: message.to_string(),
        };

        if let (Some(started), Some(finished)) = (self.started, self.finished) {
            if started > finished {
                return Err(invalid("started after finished"));
            }
        }
        match (self.status.is_terminal(), self.finished.is_some()) {
            (true, false) => return Err(invalid("terminal status without finish time")),
            (false, true) => return Err(invalid("finish time on a non-terminal status")),
            _ => {}
        }
        if self.is_deduped() && self.status != TaskStatus::Success {
            return Err(invalid("deduplicated result must be SUCCESS"));
        }
        Ok(())
    }

    /// Apply a reported state change.
    ///
    /// Terminal tasks ignore every later update and a task never moves back
    /// from RUNNING to PENDING. Returns whether anything changed.
    pub fn apply(&mut self, update: &TaskUpdate) -> Result<bool, ModelError> {
        if self.status.is_terminal() || update.status.rank() < self.status.rank() {
            return Ok(false);
        }

        let mut next = self.clone();
        next.status = update.status;
        next.started = update.started.or(self.started);
        next.finished = if update.status.is_terminal() {
            update.finished
        } else {
            None
        };
        if update.machine_id.is_some() {
            next.machine_id = update.machine_id.clone();
        }
        if update.cas_output.is_some() {
            next.cas_output = update.cas_output.clone();
        }
        if update.deduped_from.is_some() {
            next.deduped_from = update.deduped_from.clone();
        }
        next.validate()?;

        let changed = next != *self;
        *self = next;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task() -> Task {
        Task::new("t1", TaskKey::new("R", "abc", "T"), Utc::now(), 0, 2)
    }

    fn finished(status: TaskStatus) -> TaskUpdate {
        let now = Utc::now();
        TaskUpdate {
            started: Some(now - Duration::minutes(5)),
            finished: Some(now),
            ..TaskUpdate::status(status)
        }
    }

    #[test]
    fn test_task_key_display() {
        let key = TaskKey::new("R", "abc", "T");
        assert_eq!(key.to_string(), "R@abc:T");
        assert_eq!(key.with_forced_job("j1").to_string(), "R@abc:T#j1");
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let s = serde_json::to_string(&TaskStatus::Mishap).unwrap();
        assert_eq!(s, "\"MISHAP\"");
        assert!(TaskStatus::Mishap.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_apply_running_then_success() {
        let mut t = task();
        let running = TaskUpdate {
            started: Some(Utc::now()),
            machine_id: Some("bot-1".to_string()),
            ..TaskUpdate::status(TaskStatus::Running)
        };
        assert!(t.apply(&running).unwrap());
        assert_eq!(t.status, TaskStatus::Running);
        assert!(t.finished.is_none());

        assert!(t.apply(&finished(TaskStatus::Success)).unwrap());
        assert_eq!(t.status, TaskStatus::Success);
        assert_eq!(t.machine_id.as_deref(), Some("bot-1"));
        t.validate().unwrap();
    }

    #[test]
    fn test_apply_terminal_twice_is_noop() {
        let mut t = task();
        let update = finished(TaskStatus::Failure);
        assert!(t.apply(&update).unwrap());
        let snapshot = t.clone();

        assert!(!t.apply(&update).unwrap());
        assert!(!t.apply(&finished(TaskStatus::Success)).unwrap());
        assert_eq!(t, snapshot);
    }

    #[test]
    fn test_apply_never_regresses_to_pending() {
        let mut t = task();
        t.apply(&TaskUpdate::status(TaskStatus::Running)).unwrap();
        assert!(!t.apply(&TaskUpdate::status(TaskStatus::Pending)).unwrap());
        assert_eq!(t.status, TaskStatus::Running);
    }

    #[test]
    fn test_apply_rejects_terminal_without_finish() {
        let mut t = task();
        let result = t.apply(&TaskUpdate::status(TaskStatus::Success));
        assert!(matches!(result, Err(ModelError::InvalidTiming { .. })));
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn test_apply_rejects_started_after_finished() {
        let mut t = task();
        let now = Utc::now();
        let update = TaskUpdate {
            started: Some(now),
            finished: Some(now - Duration::seconds(1)),
            ..TaskUpdate::status(TaskStatus::Failure)
        };
        assert!(t.apply(&update).is_err());
    }

    #[test]
    fn test_dedup_must_be_success() {
        let mut t = task();
        let update = TaskUpdate {
            deduped_from: Some("orig".to_string()),
            ..finished(TaskStatus::Failure)
        };
        assert!(t.apply(&update).is_err());

        let update = TaskUpdate {
            deduped_from: Some("orig".to_string()),
            ..finished(TaskStatus::Success)
        };
        assert!(t.apply(&update).unwrap());
        assert!(t.is_deduped());
    }

    #[test]
    fn test_attempts_remaining() {
        let mut t = task();
        assert!(t.attempts_remaining());
        t.attempt = 1;
        assert!(!t.attempts_remaining());
    }
}
