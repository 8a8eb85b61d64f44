//! Task and job state store
//!
//! [`TaskStore`] is the single owner of scheduler state. Every mutation goes
//! through one `RwLock`; readers get cloned values, so nobody observes a task
//! update without the matching job-slot update.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_core::{Job, JobId, Task, TaskKey, TaskUpdate};
use kiln_executor::TaskRequest;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};

/// What the loop meant to dispatch under a correlation id.
///
/// Lets a completion that arrives before the trigger call returns (or after
/// it timed out) be attributed to the right key and jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchIntent {
    pub correlation_id: String,
    pub key: TaskKey,
    pub attempt: u32,
    pub max_attempts: u32,
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub retry_of: Option<String>,
    pub created: DateTime<Utc>,
    /// The backend refused the trigger; later notifications are ignored
    #[serde(default)]
    pub abandoned: bool,
}

impl DispatchIntent {
    pub fn from_request(req: &TaskRequest, created: DateTime<Utc>) -> Self {
        Self {
            correlation_id: req.correlation_id.clone(),
            key: req.key.clone(),
            attempt: req.attempt,
            max_attempts: req.max_attempts,
            job_ids: req.job_ids.clone(),
            retry_of: req.retry_of.clone(),
            created,
            abandoned: false,
        }
    }
}

/// A failed attempt whose key should be retried on the next tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRequest {
    pub key: TaskKey,
    pub failed_task_id: String,
}

/// An externally signalled periodic trigger (e.g. "nightly")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicTrigger {
    /// Delivery id; a trigger id is admitted at most once
    pub id: String,
    /// Trigger name matched against `periodic:<name>` job specs
    pub name: String,
}

/// Everything the store persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub tasks: BTreeMap<String, Task>,
    pub jobs: BTreeMap<JobId, Job>,
    pub intents: BTreeMap<String, DispatchIntent>,
    pub retry_queue: Vec<RetryRequest>,
    pub periodic_queue: Vec<PeriodicTrigger>,
    /// Admitted trigger id -> when it was admitted
    pub periodic_admitted: BTreeMap<String, DateTime<Utc>>,
}

/// What [`TaskStore::prune`] removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub intents: usize,
    pub periodic: usize,
}

/// Result of recording or updating a task
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub task: Task,
    /// Whether the stored task changed
    pub changed: bool,
    /// Whether a retry of the task was queued
    pub retry_queued: bool,
}

/// Shared scheduler state
#[derive(Debug, Default)]
pub struct TaskStore {
    state: RwLock<StoreSnapshot>,
    path: Option<PathBuf>,
}

impl TaskStore {
    /// Create an empty store that is never persisted
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading it if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: StoreSnapshot = serde_json::from_str(&content)?;
            info!(
                path = %path.display(),
                tasks = snapshot.tasks.len(),
                jobs = snapshot.jobs.len(),
                "loaded scheduler state"
            );
            snapshot
        } else {
            debug!(path = %path.display(), "no saved state, starting empty");
            StoreSnapshot::default()
        };

        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    /// Create a store from an existing snapshot
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the snapshot to the store's file, if it has one
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state)?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "saved scheduler state");
        Ok(())
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.clone()
    }

    pub async fn task(&self, id: &str) -> Option<Task> {
        self.state.read().await.tasks.get(id).cloned()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.state.read().await.tasks.values().cloned().collect()
    }

    /// Every attempt recorded for a key, oldest attempt first
    pub async fn tasks_for_key(&self, key: &TaskKey) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.key == *key)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.attempt.cmp(&b.attempt).then(a.created.cmp(&b.created)));
        tasks
    }

    /// Tasks that have not reached a terminal status
    pub async fn outstanding_tasks(&self) -> Vec<Task> {
        self.state
            .read()
            .await
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn job(&self, id: &JobId) -> Option<Job> {
        self.state.read().await.jobs.get(id).cloned()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.state.read().await.jobs.values().cloned().collect()
    }

    /// Jobs that have not been archived
    pub async fn active_jobs(&self) -> Vec<Job> {
        self.state
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.finished.is_none())
            .cloned()
            .collect()
    }

    pub async fn insert_job(&self, job: Job) {
        self.state.write().await.jobs.insert(job.id.clone(), job);
    }

    /// Insert a job unless one with the same name and trigger already exists
    /// at the same commit. Returns whether the job was inserted.
    pub async fn insert_job_if_absent(&self, job: Job) -> bool {
        let mut state = self.state.write().await;
        let exists = state.jobs.values().any(|j| {
            j.repo == job.repo
                && j.revision == job.revision
                && j.name == job.name
                && j.trigger == job.trigger
        });
        if exists {
            return false;
        }
        state.jobs.insert(job.id.clone(), job);
        true
    }

    /// Mark a job archived. Returns false if it already was.
    pub async fn finish_job(&self, id: &JobId, finished: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::Store(format!("unknown job {}", id)))?;
        if job.finished.is_some() {
            return Ok(false);
        }
        job.finished = Some(finished);
        Ok(true)
    }

    pub async fn record_intent(&self, intent: DispatchIntent) {
        self.state
            .write()
            .await
            .intents
            .insert(intent.correlation_id.clone(), intent);
    }

    pub async fn intent(&self, correlation_id: &str) -> Option<DispatchIntent> {
        self.state.read().await.intents.get(correlation_id).cloned()
    }

    /// Mark an intent abandoned. Returns whether it existed.
    pub async fn abandon_intent(&self, correlation_id: &str) -> bool {
        match self.state.write().await.intents.get_mut(correlation_id) {
            Some(intent) => {
                intent.abandoned = true;
                true
            }
            None => false,
        }
    }

    pub async fn remove_intent(&self, correlation_id: &str) -> Option<DispatchIntent> {
        self.state.write().await.intents.remove(correlation_id)
    }

    /// Record a task attempt and project it into the jobs it belongs to.
    ///
    /// If the task is already known (its completion arrived first, or the
    /// backend reported it again) the new state is applied as an update and
    /// the job lists are merged.
    pub async fn record_task(&self, task: Task) -> Result<UpdateOutcome> {
        let mut state = self.state.write().await;

        let snapshot: &mut StoreSnapshot = &mut state;
        let (stored, changed) = match snapshot.tasks.get_mut(&task.id) {
            Some(existing) => {
                if existing.key != task.key {
                    return Err(kiln_core::ModelError::KeyMismatch {
                        id: task.id.clone(),
                        expected: existing.key.to_string(),
                        actual: task.key.to_string(),
                    }
                    .into());
                }
                let mut changed = existing.apply(&update_of(&task))?;
                for job in &task.jobs {
                    if !existing.jobs.contains(job) {
                        existing.jobs.push(job.clone());
                        changed = true;
                    }
                }
                if existing.retry_of.is_none() && task.retry_of.is_some() {
                    existing.retry_of = task.retry_of.clone();
                    changed = true;
                }
                (existing.clone(), changed)
            }
            None => {
                task.validate()?;
                snapshot.tasks.insert(task.id.clone(), task.clone());
                (task, true)
            }
        };

        if !stored.correlation_id.is_empty() {
            snapshot.intents.remove(&stored.correlation_id);
        }
        project_into_jobs(snapshot, &stored);
        let retry_queued = queue_retry_if_due(snapshot, &stored);

        Ok(UpdateOutcome {
            task: stored,
            changed,
            retry_queued,
        })
    }

    /// Apply a reported state change to a known task.
    ///
    /// Returns `None` when the task is unknown.
    pub async fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<Option<UpdateOutcome>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Ok(None);
        };

        let changed = task.apply(update)?;
        let task = task.clone();
        if changed {
            project_into_jobs(&mut state, &task);
        }
        let retry_queued = changed && queue_retry_if_due(&mut state, &task);

        Ok(Some(UpdateOutcome {
            task,
            changed,
            retry_queued,
        }))
    }

    /// Attach an existing task to another job's slot
    pub async fn attach_task(&self, job_id: &JobId, task_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::Store(format!("unknown task {}", task_id)))?;
        if !task.jobs.contains(job_id) {
            task.jobs.push(job_id.clone());
        }
        let task = task.clone();

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::Store(format!("unknown job {}", job_id)))?;
        job.add_attempt(&task.key.name, task.summary())?;
        queue_retry_if_due(&mut state, &task);
        Ok(())
    }

    /// Retries waiting to be dispatched
    pub async fn retries(&self) -> Vec<RetryRequest> {
        self.state.read().await.retry_queue.clone()
    }

    /// Drop a retry once its new attempt has been dispatched
    pub async fn complete_retry(&self, failed_task_id: &str) {
        self.state
            .write()
            .await
            .retry_queue
            .retain(|r| r.failed_task_id != failed_task_id);
    }

    /// Queue a periodic trigger. Returns false for an id already queued or
    /// admitted.
    pub async fn enqueue_periodic(&self, trigger: PeriodicTrigger) -> bool {
        let mut state = self.state.write().await;
        if state.periodic_admitted.contains_key(&trigger.id)
            || state.periodic_queue.iter().any(|t| t.id == trigger.id)
        {
            debug!(id = %trigger.id, "duplicate periodic trigger ignored");
            return false;
        }
        state.periodic_queue.push(trigger);
        true
    }

    pub async fn pending_periodic(&self) -> Vec<PeriodicTrigger> {
        self.state.read().await.periodic_queue.clone()
    }

    /// Mark a periodic trigger admitted
    pub async fn complete_periodic(&self, id: &str) {
        let mut state = self.state.write().await;
        state.periodic_queue.retain(|t| t.id != id);
        state.periodic_admitted.insert(id.to_string(), Utc::now());
    }

    /// Drop bookkeeping that can no longer matter: abandoned intents, and
    /// intents and admitted periodic ids older than `max_age`.
    ///
    /// An expired periodic id is admitted again if it is redelivered.
    pub async fn prune(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> PruneSummary {
        let cutoff = chrono::Duration::from_std(max_age)
            .map(|age| now - age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut state = self.state.write().await;

        let intents = state.intents.len();
        state
            .intents
            .retain(|_, intent| !intent.abandoned && intent.created >= cutoff);
        let periodic = state.periodic_admitted.len();
        state.periodic_admitted.retain(|_, admitted| *admitted >= cutoff);

        let summary = PruneSummary {
            intents: intents - state.intents.len(),
            periodic: periodic - state.periodic_admitted.len(),
        };
        if summary != PruneSummary::default() {
            debug!(intents = summary.intents, periodic = summary.periodic, "pruned store");
        }
        summary
    }
}

fn update_of(task: &Task) -> TaskUpdate {
    TaskUpdate {
        status: task.status,
        started: task.started,
        finished: task.finished,
        machine_id: task.machine_id.clone(),
        cas_output: task.cas_output.clone(),
        deduped_from: task.deduped_from.clone(),
    }
}

fn project_into_jobs(state: &mut StoreSnapshot, task: &Task) {
    for job_id in &task.jobs {
        let Some(job) = state.jobs.get_mut(job_id) else {
            warn!(task_id = %task.id, %job_id, "task references unknown job");
            continue;
        };
        if let Err(e) = job.add_attempt(&task.key.name, task.summary()) {
            warn!(task_id = %task.id, error = %e, "could not record attempt in job");
        }
    }
}

/// Queue a retry when a failed attempt has budget left, nothing has retried
/// it yet and some unarchived job still waits on it.
fn queue_retry_if_due(state: &mut StoreSnapshot, task: &Task) -> bool {
    if !task.status.is_failed() || !task.attempts_remaining() {
        return false;
    }
    if state
        .tasks
        .values()
        .any(|t| t.retry_of.as_deref() == Some(task.id.as_str()))
    {
        return false;
    }
    if state.retry_queue.iter().any(|r| r.failed_task_id == task.id) {
        return false;
    }
    let needed = task
        .jobs
        .iter()
        .filter_map(|id| state.jobs.get(id))
        .any(|job| job.finished.is_none());
    if !needed {
        return false;
    }

    debug!(task_id = %task.id, key = %task.key, "queued retry");
    state.retry_queue.push(RetryRequest {
        key: task.key.clone(),
        failed_task_id: task.id.clone(),
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Commit, JobTrigger, TaskStatus};
    use tempfile::TempDir;

    fn commit() -> Commit {
        Commit::new("repo", "abc", Utc::now())
    }

    fn job() -> Job {
        let mut deps = BTreeMap::new();
        deps.insert("build".to_string(), Vec::new());
        Job::new("ci", &commit(), JobTrigger::AnyCommit, 1.0, deps, Utc::now())
    }

    fn task(id: &str, job: &Job, attempt: u32) -> Task {
        let mut task = Task::new(id, job.task_key("build"), Utc::now(), attempt, 2);
        task.jobs.push(job.id.clone());
        task
    }

    fn finished(status: TaskStatus) -> TaskUpdate {
        let now = Utc::now();
        TaskUpdate {
            started: Some(now),
            finished: Some(now),
            ..TaskUpdate::status(status)
        }
    }

    #[tokio::test]
    async fn test_record_task_projects_into_job() {
        let store = TaskStore::new();
        let job = job();
        store.insert_job(job.clone()).await;

        let outcome = store.record_task(task("t1", &job, 0)).await.unwrap();
        assert!(outcome.changed);

        let job = store.job(&job.id).await.unwrap();
        assert_eq!(job.latest("build").unwrap().id, "t1");
    }

    #[tokio::test]
    async fn test_insert_job_if_absent() {
        let store = TaskStore::new();
        assert!(store.insert_job_if_absent(job()).await);
        assert!(!store.insert_job_if_absent(job()).await);
        assert_eq!(store.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_queues_one_retry() {
        let store = TaskStore::new();
        let job = job();
        store.insert_job(job.clone()).await;
        store.record_task(task("t1", &job, 0)).await.unwrap();

        let outcome = store
            .update_task("t1", &finished(TaskStatus::Failure))
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.retry_queued);

        // A repeated terminal update is a no-op
        let again = store
            .update_task("t1", &finished(TaskStatus::Failure))
            .await
            .unwrap()
            .unwrap();
        assert!(!again.changed);
        assert!(!again.retry_queued);
        assert_eq!(store.retries().await.len(), 1);

        store.complete_retry("t1").await;
        assert!(store.retries().await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_attempt_is_not_retried() {
        let store = TaskStore::new();
        let job = job();
        store.insert_job(job.clone()).await;
        store.record_task(task("t2", &job, 1)).await.unwrap();

        let outcome = store
            .update_task("t2", &finished(TaskStatus::Mishap))
            .await
            .unwrap()
            .unwrap();
        assert!(!outcome.retry_queued);
        assert!(store.retries().await.is_empty());
    }

    #[tokio::test]
    async fn test_record_known_task_merges() {
        let store = TaskStore::new();
        let job = job();
        store.insert_job(job.clone()).await;

        let mut done = task("t1", &job, 0);
        let now = Utc::now();
        done.apply(&TaskUpdate {
            started: Some(now),
            finished: Some(now),
            ..TaskUpdate::status(TaskStatus::Success)
        })
        .unwrap();
        store.record_task(done).await.unwrap();

        // The trigger response arrives late and reports PENDING
        let outcome = store.record_task(task("t1", &job, 0)).await.unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.task.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_periodic_dedup() {
        let store = TaskStore::new();
        let nightly = PeriodicTrigger {
            id: "n-1".to_string(),
            name: "nightly".to_string(),
        };
        assert!(store.enqueue_periodic(nightly.clone()).await);
        assert!(!store.enqueue_periodic(nightly.clone()).await);

        store.complete_periodic("n-1").await;
        assert!(store.pending_periodic().await.is_empty());
        assert!(!store.enqueue_periodic(nightly).await);
    }

    #[tokio::test]
    async fn test_save_and_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("state.json");

        let store = TaskStore::open(&path).unwrap();
        let job = job();
        store.insert_job(job.clone()).await;
        store.record_task(task("t1", &job, 0)).await.unwrap();
        store.save().await.unwrap();

        let reopened = TaskStore::open(&path).unwrap();
        assert_eq!(reopened.tasks().await.len(), 1);
        assert_eq!(
            reopened.job(&job.id).await.unwrap().latest("build").unwrap().id,
            "t1"
        );
    }

    fn intent(correlation_id: &str, created: DateTime<Utc>) -> DispatchIntent {
        DispatchIntent {
            correlation_id: correlation_id.to_string(),
            key: TaskKey::new("repo", "abc", "build"),
            attempt: 0,
            max_attempts: 2,
            job_ids: Vec::new(),
            retry_of: None,
            created,
            abandoned: false,
        }
    }

    #[tokio::test]
    async fn test_prune_intents() {
        let store = TaskStore::new();
        let now = Utc::now();
        store.record_intent(intent("fresh", now)).await;
        store.record_intent(intent("refused", now)).await;
        store
            .record_intent(intent("stale", now - chrono::Duration::hours(30)))
            .await;
        assert!(store.abandon_intent("refused").await);

        let summary = store.prune(now, std::time::Duration::from_secs(24 * 3600)).await;
        assert_eq!(summary.intents, 2);
        assert!(store.intent("fresh").await.is_some());
        assert!(store.intent("refused").await.is_none());
        assert!(store.intent("stale").await.is_none());
    }

    #[tokio::test]
    async fn test_prune_expires_periodic_ids() {
        let store = TaskStore::new();
        let nightly = PeriodicTrigger {
            id: "n-1".to_string(),
            name: "nightly".to_string(),
        };
        store.enqueue_periodic(nightly.clone()).await;
        store.complete_periodic("n-1").await;

        let day = std::time::Duration::from_secs(24 * 3600);
        assert_eq!(store.prune(Utc::now(), day).await.periodic, 0);
        assert!(!store.enqueue_periodic(nightly.clone()).await);

        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(store.prune(later, day).await.periodic, 1);
        assert!(store.snapshot().await.periodic_admitted.is_empty());
        assert!(store.enqueue_periodic(nightly).await);
    }
}
