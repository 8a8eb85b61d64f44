//! Common types for task executors

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::model::{CacheMount, CipdPackage};
use kiln_core::{Dimension, JobId, ModelError, Task, TaskKey, TaskSpec, TaskStatus, TaskUpdate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ExecutorError, Result};

/// Backend-recommended expiration when a spec leaves it unset
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(4 * 60 * 60);

/// Backend-recommended execution timeout when a spec leaves it unset
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Backend-recommended IO timeout when a spec leaves it unset
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// How far back pending-task queries look by default
pub const DEFAULT_PENDING_LOOKBACK: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Default wall-clock bound on a trigger call
pub const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_secs(60);

/// Default backend priority (lower runs first)
pub const DEFAULT_PRIORITY: u32 = 100;

/// Dimension key every request must carry
pub const POOL_DIMENSION: &str = "pool";

/// Prefix of the tags kiln attaches to triggered tasks
pub const TAG_PREFIX: &str = "kiln-";

/// Time range a pending-task query is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PendingWindow {
    /// Window of length `lookback` ending now
    pub fn ending_now(lookback: Duration) -> Self {
        Self::ending_at(Utc::now(), lookback)
    }

    pub fn ending_at(end: DateTime<Utc>, lookback: Duration) -> Self {
        let lookback = chrono::Duration::from_std(lookback)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_PENDING_LOOKBACK.as_secs() as i64));
        Self {
            start: end - lookback,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Length of the window
    pub fn span(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Request to run one task attempt on the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Human-readable task name
    pub name: String,
    pub key: TaskKey,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Jobs the attempt is dispatched for
    pub job_ids: Vec<JobId>,
    /// The failed attempt this one retries
    pub retry_of: Option<String>,
    /// Caller-generated id echoed back in completion notifications
    pub correlation_id: String,
    pub dimensions: Vec<Dimension>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub caches: Vec<CacheMount>,
    pub cipd_packages: Vec<CipdPackage>,
    /// CAS input root as `hash/size`
    pub cas_input: Option<String>,
    pub outputs: Vec<String>,
    pub idempotent: bool,
    /// Zero means [`DEFAULT_EXPIRATION`]
    pub expiration: Duration,
    /// Zero means [`DEFAULT_EXECUTION_TIMEOUT`]
    pub execution_timeout: Duration,
    /// Zero means [`DEFAULT_IO_TIMEOUT`]
    pub io_timeout: Duration,
    pub service_account: Option<String>,
    pub priority: u32,
}

impl TaskRequest {
    /// Build a request for one attempt at `key` from its task spec.
    ///
    /// A spec without a `pool` dimension is sent to `default_pool`.
    pub fn from_spec(
        spec: &TaskSpec,
        key: TaskKey,
        attempt: u32,
        default_pool: &str,
    ) -> std::result::Result<Self, ModelError> {
        let mut dimensions = spec.parsed_dimensions()?;
        if Dimension::find(&dimensions, POOL_DIMENSION).is_none() {
            dimensions.push(Dimension::new(POOL_DIMENSION, default_pool));
        }

        Ok(Self {
            name: key.name.clone(),
            key,
            attempt,
            max_attempts: spec.max_attempts.max(1),
            job_ids: Vec::new(),
            retry_of: None,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            dimensions,
            command: spec.command.clone(),
            env: spec.env.clone(),
            env_prefixes: spec.env_prefixes.clone(),
            caches: spec.caches.clone(),
            cipd_packages: spec.cipd_packages.clone(),
            cas_input: spec.cas_input.clone(),
            outputs: spec.outputs.clone(),
            idempotent: spec.idempotent,
            expiration: Duration::from_secs(spec.expiration_secs),
            execution_timeout: Duration::from_secs(spec.execution_timeout_secs),
            io_timeout: Duration::from_secs(spec.io_timeout_secs),
            service_account: spec.service_account.clone(),
            priority: DEFAULT_PRIORITY,
        })
    }

    /// Pool the request targets
    pub fn pool(&self) -> Option<&str> {
        Dimension::find(&self.dimensions, POOL_DIMENSION)
    }

    pub fn effective_expiration(&self) -> Duration {
        or_default(self.expiration, DEFAULT_EXPIRATION)
    }

    pub fn effective_execution_timeout(&self) -> Duration {
        or_default(self.execution_timeout, DEFAULT_EXECUTION_TIMEOUT)
    }

    pub fn effective_io_timeout(&self) -> Duration {
        or_default(self.io_timeout, DEFAULT_IO_TIMEOUT)
    }

    /// Typed tags describing the attempt
    pub fn tags(&self) -> TaskTags {
        TaskTags {
            key: Some(self.key.clone()),
            attempt: Some(self.attempt),
            max_attempts: Some(self.max_attempts),
            correlation_id: Some(self.correlation_id.clone()),
            job_ids: self.job_ids.clone(),
            retry_of: self.retry_of.clone(),
        }
    }

    /// Identity of the work the request describes.
    ///
    /// Two idempotent requests with equal dedup keys may share one result.
    /// Attempt bookkeeping and the correlation id are not part of it.
    pub fn dedup_key(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");

        let mut dims: Vec<String> = self.dimensions.iter().map(|d| d.to_string()).collect();
        dims.sort();
        for d in dims {
            hasher.update(d.as_bytes());
            hasher.update(b"\0");
        }

        for arg in &self.command {
            hasher.update(arg.as_bytes());
            hasher.update(b"\0");
        }

        for (k, v) in &self.env {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\0");
        }

        for (k, paths) in &self.env_prefixes {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(paths.join(":").as_bytes());
            hasher.update(b"\0");
        }

        for pkg in &self.cipd_packages {
            hasher.update(format!("{}@{}:{}", pkg.name, pkg.version, pkg.path).as_bytes());
            hasher.update(b"\0");
        }

        if let Some(cas) = &self.cas_input {
            hasher.update(cas.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

/// Kiln bookkeeping attached to a remote task as `kiln-<field>:<value>` tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTags {
    pub key: Option<TaskKey>,
    pub attempt: Option<u32>,
    pub max_attempts: Option<u32>,
    pub correlation_id: Option<String>,
    pub job_ids: Vec<JobId>,
    pub retry_of: Option<String>,
}

impl TaskTags {
    /// Render as backend tag strings
    pub fn to_strings(&self) -> Vec<String> {
        let mut tags = Vec::new();
        let mut push = |field: &str, value: &str| tags.push(format!("{TAG_PREFIX}{field}:{value}"));

        if let Some(key) = &self.key {
            push("repo", &key.repo);
            push("revision", &key.revision);
            push("name", &key.name);
            if key.is_forced() {
                push("forced-job-id", &key.forced_job_id);
            }
        }
        if let Some(attempt) = self.attempt {
            push("attempt", &attempt.to_string());
        }
        if let Some(max_attempts) = self.max_attempts {
            push("max-attempts", &max_attempts.to_string());
        }
        if let Some(id) = &self.correlation_id {
            push("correlation-id", id);
        }
        for job in &self.job_ids {
            push("job", job.as_str());
        }
        if let Some(id) = &self.retry_of {
            push("retry-of", id);
        }
        tags
    }

    /// Parse kiln tags out of a backend tag list.
    ///
    /// Tags without the kiln prefix are ignored. A kiln tag that cannot be
    /// interpreted, or a partial task key, is a malformed response.
    pub fn parse(tags: &[String]) -> Result<Self> {
        let mut parsed = Self::default();
        let (mut repo, mut revision, mut name, mut forced) = (None, None, None, None);

        for tag in tags {
            let Some(rest) = tag.strip_prefix(TAG_PREFIX) else {
                continue;
            };
            let (field, value) = rest
                .split_once(':')
                .ok_or_else(|| ExecutorError::MalformedResponse(format!("tag '{}'", tag)))?;
            let value = value.to_string();

            match field {
                "repo" => repo = Some(value),
                "revision" => revision = Some(value),
                "name" => name = Some(value),
                "forced-job-id" => forced = Some(value),
                "attempt" => parsed.attempt = Some(parse_number(tag, &value)?),
                "max-attempts" => parsed.max_attempts = Some(parse_number(tag, &value)?),
                "correlation-id" => parsed.correlation_id = Some(value),
                "job" => parsed.job_ids.push(JobId(value)),
                "retry-of" => parsed.retry_of = Some(value),
                _ => {
                    return Err(ExecutorError::MalformedResponse(format!(
                        "unknown tag field '{}'",
                        field
                    )))
                }
            }
        }

        parsed.key = match (repo, revision, name) {
            (Some(repo), Some(revision), Some(name)) => {
                let key = TaskKey::new(repo, revision, name);
                Some(match forced {
                    Some(job) => key.with_forced_job(job),
                    None => key,
                })
            }
            (None, None, None) if forced.is_none() => None,
            _ => {
                return Err(ExecutorError::MalformedResponse(
                    "incomplete task key tags".to_string(),
                ))
            }
        };

        Ok(parsed)
    }
}

fn parse_number(tag: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| ExecutorError::MalformedResponse(format!("tag '{}' is not a number", tag)))
}

/// State of a remote task as reported by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Backend-assigned id
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub machine_id: Option<String>,
    pub cas_output: Option<String>,
    pub deduped_from: Option<String>,
    pub tags: TaskTags,
}

impl TaskResult {
    /// The state change this result describes
    pub fn update(&self) -> TaskUpdate {
        TaskUpdate {
            status: self.status,
            started: self.started,
            finished: self.finished,
            machine_id: self.machine_id.clone(),
            cas_output: self.cas_output.clone(),
            deduped_from: self.deduped_from.clone(),
        }
    }

    /// Materialize a task record for this result
    pub fn to_task(
        &self,
        key: TaskKey,
        attempt: u32,
        max_attempts: u32,
    ) -> std::result::Result<Task, ModelError> {
        let mut task = Task::new(&self.id, key, self.created, attempt, max_attempts);
        task.correlation_id = self.tags.correlation_id.clone().unwrap_or_default();
        task.jobs = self.tags.job_ids.clone();
        task.retry_of = self.tags.retry_of.clone();
        task.apply(&self.update())?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TaskSpec {
        TaskSpec {
            dimensions: vec!["os:Linux".to_string()],
            command: vec!["make".to_string(), "test".to_string()],
            idempotent: true,
            max_attempts: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_from_spec_adds_default_pool() {
        let key = TaskKey::new("repo", "abc", "test");
        let req = TaskRequest::from_spec(&spec(), key, 0, "ci").unwrap();
        assert_eq!(req.pool(), Some("ci"));
        assert_eq!(req.max_attempts, 3);
        assert!(!req.correlation_id.is_empty());
    }

    #[test]
    fn test_zero_timeouts_use_backend_defaults() {
        let key = TaskKey::new("repo", "abc", "test");
        let mut req = TaskRequest::from_spec(&spec(), key, 0, "ci").unwrap();
        assert_eq!(req.effective_expiration(), DEFAULT_EXPIRATION);
        assert_eq!(req.effective_execution_timeout(), DEFAULT_EXECUTION_TIMEOUT);
        assert_eq!(req.effective_io_timeout(), DEFAULT_IO_TIMEOUT);

        req.io_timeout = Duration::from_secs(30);
        assert_eq!(req.effective_io_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_dedup_key_ignores_attempt_bookkeeping() {
        let key = TaskKey::new("repo", "abc", "test");
        let a = TaskRequest::from_spec(&spec(), key.clone(), 0, "ci").unwrap();
        let mut b = TaskRequest::from_spec(&spec(), key, 1, "ci").unwrap();
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.dedup_key(), b.dedup_key());

        b.command.push("--verbose".to_string());
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_tags_parse_back() {
        let key = TaskKey::new("repo", "abc", "test").with_forced_job("job-1");
        let mut req = TaskRequest::from_spec(&spec(), key.clone(), 1, "ci").unwrap();
        req.job_ids = vec![JobId("job-1".to_string())];
        req.retry_of = Some("t0".to_string());

        let mut strings = req.tags().to_strings();
        strings.push("pool:ci".to_string());
        let tags = TaskTags::parse(&strings).unwrap();
        assert_eq!(tags, req.tags());
        assert_eq!(tags.key, Some(key));
    }

    #[test]
    fn test_malformed_tags() {
        let bad_attempt = vec!["kiln-attempt:one".to_string()];
        assert!(matches!(
            TaskTags::parse(&bad_attempt),
            Err(ExecutorError::MalformedResponse(_))
        ));

        let partial_key = vec!["kiln-repo:r".to_string(), "kiln-name:n".to_string()];
        assert!(TaskTags::parse(&partial_key).is_err());

        let no_kiln_tags = vec!["os:Linux".to_string()];
        assert_eq!(TaskTags::parse(&no_kiln_tags).unwrap(), TaskTags::default());
    }

    #[test]
    fn test_pending_window_bounds() {
        let end = Utc::now();
        let window = PendingWindow::ending_at(end, DEFAULT_PENDING_LOOKBACK);
        assert_eq!(window.span(), chrono::Duration::days(2));
        assert!(window.contains(end - chrono::Duration::hours(47)));
        assert!(!window.contains(end - chrono::Duration::hours(49)));
    }

    #[test]
    fn test_result_to_task() {
        let now = Utc::now();
        let result = TaskResult {
            id: "t1".to_string(),
            name: "test".to_string(),
            status: TaskStatus::Success,
            created: now,
            started: None,
            finished: Some(now),
            machine_id: None,
            cas_output: None,
            deduped_from: Some("t0".to_string()),
            tags: TaskTags {
                correlation_id: Some("c1".to_string()),
                ..Default::default()
            },
        };
        let task = result
            .to_task(TaskKey::new("repo", "abc", "test"), 0, 2)
            .unwrap();
        assert!(task.is_deduped());
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.correlation_id, "c1");
    }
}
