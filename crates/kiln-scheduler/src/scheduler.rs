//! Scheduling loop: admits jobs, scores candidates and dispatches them

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use kiln_core::config::SchedulerConfig;
use kiln_core::{Commit, CommitSpecs, Job, JobId, JobTrigger, Machine, TaskKey};
use kiln_executor::{ExecutorError, TaskExecutor, TaskResult, TimeoutExecutor};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::candidate::{sort_candidates, Candidate};
use crate::error::{Result, SchedulerError};
use crate::reporter::{SchedulerEvent, SchedulerReporter};
use crate::sources::{CommitSource, SpecSource};
use crate::store::{DispatchIntent, PeriodicTrigger, TaskStore};

/// Counters for one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub jobs_admitted: usize,
    pub candidates: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub stuck: usize,
    pub jobs_finished: usize,
}

/// Specs fetched during one tick, keyed by (repo, revision)
type SpecCache = HashMap<(String, String), CommitSpecs>;

/// The scheduling loop
pub struct Scheduler {
    config: SchedulerConfig,
    executor: Arc<dyn TaskExecutor>,
    store: Arc<TaskStore>,
    commits: Arc<dyn CommitSource>,
    specs: Arc<dyn SpecSource>,
    reporter: Arc<dyn SchedulerReporter>,
    /// Keys already reported as stuck
    stuck: Mutex<HashSet<TaskKey>>,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// Trigger calls made through `executor` are bounded by
    /// `config.trigger_timeout_secs`.
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<TaskStore>,
        commits: Arc<dyn CommitSource>,
        specs: Arc<dyn SpecSource>,
        reporter: Arc<dyn SchedulerReporter>,
    ) -> Self {
        let executor: Arc<dyn TaskExecutor> =
            Arc::new(TimeoutExecutor::new(executor, config.trigger_timeout()));
        Self {
            config,
            executor,
            store,
            commits,
            specs,
            reporter,
            stuck: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Run ticks at the configured interval until `shutdown` is cancelled.
    ///
    /// A failed tick is logged and the loop carries on.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.tick_interval_secs,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Queue a periodic trigger for admission on the next tick.
    ///
    /// Returns false if the trigger id was already seen.
    pub async fn trigger_periodic(&self, id: impl Into<String>, name: impl Into<String>) -> bool {
        self.store
            .enqueue_periodic(PeriodicTrigger {
                id: id.into(),
                name: name.into(),
            })
            .await
    }

    /// Admit a forced run of `job_name` at a commit.
    ///
    /// The job's tasks are keyed to the job itself and never shared with
    /// other jobs.
    pub async fn force_job(&self, repo: &str, revision: &str, job_name: &str) -> Result<JobId> {
        let window = self
            .commits
            .commits(self.config.commit_window, self.config.time_window())
            .await?;
        let commit = window
            .into_iter()
            .find(|c| c.repo == repo && c.revision == revision)
            .unwrap_or_else(|| Commit::new(repo, revision, Utc::now()));

        let specs = self.specs.specs(&commit).await?;
        let job_spec = specs
            .jobs
            .get(job_name)
            .ok_or_else(|| SchedulerError::UnknownJob {
                repo: repo.to_string(),
                revision: revision.to_string(),
                job: job_name.to_string(),
            })?;
        let deps = specs.dependency_closure(job_name, job_spec)?;

        let job = Job::new(
            job_name,
            &commit,
            JobTrigger::Manual,
            job_spec.priority,
            deps,
            Utc::now(),
        );
        let id = job.id.clone();
        self.store.insert_job(job).await;
        self.report_admitted(&id, job_name, revision);
        Ok(id)
    }

    /// Score the current candidates without dispatching anything
    pub async fn plan(&self) -> Result<Vec<Candidate>> {
        let now = Utc::now();
        let commits = self
            .commits
            .commits(self.config.commit_window, self.config.time_window())
            .await?;
        let mut specs = SpecCache::new();
        self.admit_commit_jobs(&commits, &mut specs).await;
        self.candidates(&commits, &mut specs, now).await
    }

    /// Run one scheduling pass
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickSummary> {
        let started = Instant::now();
        let now = Utc::now();
        let mut summary = TickSummary::default();

        let commits = self
            .commits
            .commits(self.config.commit_window, self.config.time_window())
            .await?;
        debug!(commits = commits.len(), "fetched commit window");

        let mut specs = SpecCache::new();
        summary.jobs_admitted += self.admit_commit_jobs(&commits, &mut specs).await;
        summary.jobs_admitted += self.admit_periodic_jobs(&commits, &mut specs).await;

        self.store.prune(now, self.config.time_window()).await;
        self.reconcile_unclaimed().await;

        let candidates = self.candidates(&commits, &mut specs, now).await?;
        summary.candidates = candidates.len();

        let (admitted, stuck) = self.admit(candidates).await;
        summary.stuck = stuck;

        let (dispatched, failed) = self.dispatch(admitted).await;
        summary.dispatched = dispatched;
        summary.failed = failed;

        summary.jobs_finished = self.archive_finished_jobs().await?;

        if let Err(e) = self.store.save().await {
            warn!(error = %e, "failed to persist scheduler state");
        }

        self.reporter.report(&SchedulerEvent::TickCompleted {
            candidates: summary.candidates,
            dispatched: summary.dispatched,
            failed: summary.failed,
            duration: started.elapsed(),
        });
        Ok(summary)
    }

    async fn specs_for(&self, commit: &Commit, cache: &mut SpecCache) -> Result<CommitSpecs> {
        let key = (commit.repo.clone(), commit.revision.clone());
        if let Some(specs) = cache.get(&key) {
            return Ok(specs.clone());
        }
        let specs = self.specs.specs(commit).await?;
        cache.insert(key, specs.clone());
        Ok(specs)
    }

    /// Create a job for every commit-triggered job spec at every commit in
    /// the window, once per (repo, revision, job name)
    async fn admit_commit_jobs(&self, commits: &[Commit], cache: &mut SpecCache) -> usize {
        let mut admitted = 0;
        for commit in commits {
            let specs = match self.specs_for(commit, cache).await {
                Ok(specs) => specs,
                Err(e) => {
                    warn!(revision = %commit.revision, error = %e, "failed to load specs");
                    continue;
                }
            };

            let mut names: Vec<&String> = specs.jobs.keys().collect();
            names.sort();
            for name in names {
                let job_spec = &specs.jobs[name];
                if job_spec.trigger != JobTrigger::AnyCommit {
                    continue;
                }
                let deps = match specs.dependency_closure(name, job_spec) {
                    Ok(deps) => deps,
                    Err(e) => {
                        error!(job = %name, revision = %commit.revision, error = %e, "invalid job spec");
                        continue;
                    }
                };
                let job = Job::new(
                    name.as_str(),
                    commit,
                    JobTrigger::AnyCommit,
                    job_spec.priority,
                    deps,
                    Utc::now(),
                );
                let id = job.id.clone();
                if self.store.insert_job_if_absent(job).await {
                    self.report_admitted(&id, name, &commit.revision);
                    admitted += 1;
                }
            }
        }
        admitted
    }

    /// Admit queued periodic triggers against the newest commit of each repo.
    ///
    /// A trigger stays queued until every repo's jobs for it were created.
    async fn admit_periodic_jobs(&self, commits: &[Commit], cache: &mut SpecCache) -> usize {
        let triggers = self.store.pending_periodic().await;
        if triggers.is_empty() {
            return 0;
        }

        let mut newest: BTreeMap<&str, &Commit> = BTreeMap::new();
        for commit in commits {
            let entry = newest.entry(commit.repo.as_str()).or_insert(commit);
            if commit.timestamp > entry.timestamp {
                *entry = commit;
            }
        }
        if newest.is_empty() {
            debug!("no commits yet, periodic triggers stay queued");
            return 0;
        }

        let mut admitted = 0;
        for trigger in triggers {
            let wanted = JobTrigger::Periodic(trigger.name.clone());
            let mut jobs = Vec::new();
            let mut failed = false;

            for commit in newest.values() {
                let specs = match self.specs_for(commit, cache).await {
                    Ok(specs) => specs,
                    Err(e) => {
                        warn!(trigger = %trigger.id, error = %e, "periodic trigger will be retried");
                        failed = true;
                        break;
                    }
                };
                let mut names: Vec<&String> = specs.jobs.keys().collect();
                names.sort();
                for name in names {
                    let job_spec = &specs.jobs[name];
                    if job_spec.trigger != wanted {
                        continue;
                    }
                    match specs.dependency_closure(name, job_spec) {
                        Ok(deps) => jobs.push(Job::new(
                            name.as_str(),
                            commit,
                            wanted.clone(),
                            job_spec.priority,
                            deps,
                            Utc::now(),
                        )),
                        Err(e) => {
                            error!(job = %name, error = %e, "invalid periodic job spec");
                        }
                    }
                }
            }

            if failed {
                continue;
            }
            for job in jobs {
                let (id, name, revision) = (job.id.clone(), job.name.clone(), job.revision.clone());
                self.store.insert_job(job).await;
                self.report_admitted(&id, &name, &revision);
                admitted += 1;
            }
            self.store.complete_periodic(&trigger.id).await;
            info!(trigger = %trigger.id, name = %trigger.name, "periodic trigger admitted");
        }
        admitted
    }

    /// Record PENDING or RUNNING tasks the backend reports for intents we
    /// never got a trigger response for (e.g. the call timed out after the
    /// task was made, and maybe after it started)
    async fn reconcile_unclaimed(&self) {
        for pool in &self.config.pools {
            let mut unclaimed = Vec::new();
            for listed in [
                self.executor.get_pending_tasks(pool).await,
                self.executor.get_running_tasks(pool).await,
            ] {
                match listed {
                    Ok(tasks) => unclaimed.extend(tasks),
                    Err(e) => warn!(pool = %pool, error = %e, "failed to list unfinished tasks"),
                }
            }

            for result in unclaimed {
                if self.store.task(&result.id).await.is_some() {
                    continue;
                }
                let Some(cid) = result.tags.correlation_id.as_deref() else {
                    continue;
                };
                let Some(intent) = self.store.intent(cid).await else {
                    continue;
                };
                if intent.abandoned {
                    continue;
                }
                match self.record_result(&result, &intent).await {
                    Ok(()) => info!(
                        task_id = %result.id,
                        key = %intent.key,
                        status = %result.status,
                        "recovered unclaimed task"
                    ),
                    Err(e) => warn!(task_id = %result.id, error = %e, "failed to record unclaimed task"),
                }
            }
        }
    }

    async fn record_result(&self, result: &TaskResult, intent: &DispatchIntent) -> Result<()> {
        let mut task = result.to_task(intent.key.clone(), intent.attempt, intent.max_attempts)?;
        task.correlation_id = intent.correlation_id.clone();
        task.jobs = intent.job_ids.clone();
        task.retry_of = intent.retry_of.clone();
        self.store.record_task(task).await?;
        if let Some(failed) = &intent.retry_of {
            self.store.complete_retry(failed).await;
        }
        Ok(())
    }

    /// Build this tick's candidates: empty ready slots of active jobs plus
    /// queued retries, deduplicated by key
    async fn candidates(
        &self,
        commits: &[Commit],
        cache: &mut SpecCache,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>> {
        let timestamps: HashMap<(&str, &str), DateTime<Utc>> = commits
            .iter()
            .map(|c| ((c.repo.as_str(), c.revision.as_str()), c.timestamp))
            .collect();
        let commit_of = |job: &Job| {
            let ts = timestamps
                .get(&(job.repo.as_str(), job.revision.as_str()))
                .copied()
                .unwrap_or(job.created);
            Commit::new(&job.repo, &job.revision, ts)
        };

        let mut by_key: BTreeMap<TaskKey, Candidate> = BTreeMap::new();

        for job in self.store.active_jobs().await {
            let ready = job.ready_slots();
            if ready.is_empty() {
                continue;
            }
            let commit = commit_of(&job);
            let specs = match self.specs_for(&commit, cache).await {
                Ok(specs) => specs,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to load specs for job");
                    continue;
                }
            };

            for slot in ready {
                let key = job.task_key(&slot);

                // Reuse an attempt some other job already made for this key
                if let Some(existing) = self.store.tasks_for_key(&key).await.pop() {
                    debug!(job_id = %job.id, task_id = %existing.id, "reusing existing task");
                    self.store.attach_task(&job.id, &existing.id).await?;
                    continue;
                }

                let Some(spec) = specs.tasks.get(&slot) else {
                    warn!(job_id = %job.id, slot = %slot, "no task spec for slot");
                    continue;
                };
                let priority = job.priority * spec.priority;
                let candidate = by_key.entry(key.clone()).or_insert_with(|| Candidate {
                    key,
                    commit: commit.clone(),
                    spec: spec.clone(),
                    job_ids: Vec::new(),
                    priority,
                    attempt: 0,
                    retry_of: None,
                    score: 0.0,
                });
                candidate.job_ids.push(job.id.clone());
                candidate.priority = candidate.priority.max(priority);
            }
        }

        for retry in self.store.retries().await {
            let Some(failed) = self.store.task(&retry.failed_task_id).await else {
                self.store.complete_retry(&retry.failed_task_id).await;
                continue;
            };
            let jobs: Vec<Job> = self
                .store
                .active_jobs()
                .await
                .into_iter()
                .filter(|j| failed.jobs.contains(&j.id))
                .filter(|j| j.latest(&failed.key.name).map(|s| s.id.as_str()) == Some(failed.id.as_str()))
                .collect();
            let Some(first) = jobs.first() else {
                debug!(task_id = %failed.id, "no active job needs the retry");
                self.store.complete_retry(&failed.id).await;
                continue;
            };

            let commit = commit_of(first);
            let specs = match self.specs_for(&commit, cache).await {
                Ok(specs) => specs,
                Err(e) => {
                    warn!(task_id = %failed.id, error = %e, "failed to load specs for retry");
                    continue;
                }
            };
            let Some(spec) = specs.tasks.get(&failed.key.name) else {
                warn!(task_id = %failed.id, "retry has no task spec");
                continue;
            };

            let priority = jobs
                .iter()
                .map(|j| j.priority * spec.priority)
                .fold(0.0, f64::max);
            by_key.insert(
                failed.key.clone(),
                Candidate {
                    key: failed.key.clone(),
                    commit,
                    spec: spec.clone(),
                    job_ids: jobs.iter().map(|j| j.id.clone()).collect(),
                    priority,
                    attempt: failed.attempt + 1,
                    retry_of: Some(failed.id.clone()),
                    score: 0.0,
                },
            );
        }

        let mut candidates: Vec<Candidate> = by_key.into_values().collect();
        for candidate in &mut candidates {
            candidate.rescore(now, self.config.score_decay_24hr);
        }
        sort_candidates(&mut candidates);
        Ok(candidates)
    }

    /// Match candidates to free machines, best first.
    ///
    /// Returns the admitted candidates and how many were newly reported stuck.
    async fn admit(&self, candidates: Vec<Candidate>) -> (Vec<Candidate>, usize) {
        let default_pool = &self.config.default_pool;
        let mut by_pool: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for candidate in candidates {
            by_pool
                .entry(candidate.pool(default_pool))
                .or_default()
                .push(candidate);
        }

        let mut admitted = Vec::new();
        let mut stuck = 0;

        for (pool, candidates) in by_pool {
            let (free, known) = match self.machines(&pool).await {
                Ok(machines) => machines,
                Err(e) => {
                    warn!(pool = %pool, error = %e, "failed to list machines, skipping pool");
                    continue;
                }
            };
            let mut free = free;

            for candidate in candidates {
                let dims = match candidate.dimensions(default_pool) {
                    Ok(dims) => dims,
                    Err(e) => {
                        stuck += self.report_stuck(&candidate.key, e.to_string()).await;
                        continue;
                    }
                };

                if !known.iter().any(|m| m.satisfies(&dims)) {
                    let wanted: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                    let reason = format!("no machine in pool {} has [{}]", pool, wanted.join(", "));
                    stuck += self.report_stuck(&candidate.key, reason).await;
                    continue;
                }

                match free.iter().position(|m| m.satisfies(&dims)) {
                    Some(idx) => {
                        let machine = free.swap_remove(idx);
                        debug!(task = %candidate.key, machine = %machine.id, score = candidate.score, "admitted");
                        admitted.push(candidate);
                    }
                    None => debug!(task = %candidate.key, "no free machine, waiting"),
                }
            }
        }

        (admitted, stuck)
    }

    async fn machines(&self, pool: &str) -> Result<(Vec<Machine>, Vec<Machine>)> {
        let free = self.executor.get_free_machines(pool).await?;
        let known = self.executor.get_machines(pool).await?;
        Ok((free, known))
    }

    /// Trigger admitted candidates under a bounded worker pool.
    ///
    /// Returns (dispatched, failed).
    async fn dispatch(&self, candidates: Vec<Candidate>) -> (usize, usize) {
        let semaphore = Arc::new(Semaphore::new(self.config.dispatch_concurrency));
        let mut handles = Vec::new();
        let mut failed = 0;

        for candidate in candidates {
            let request = match candidate.request(&self.config.default_pool) {
                Ok(request) => request,
                Err(e) => {
                    self.report_stuck(&candidate.key, e.to_string()).await;
                    failed += 1;
                    continue;
                }
            };
            self.store
                .record_intent(DispatchIntent::from_request(&request, Utc::now()))
                .await;

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let executor = self.executor.clone();
            let handle = tokio::spawn(async move {
                let result = executor.trigger_task(&request).await;
                drop(permit);
                (request, result)
            });
            handles.push((candidate.key, handle));
        }

        let mut dispatched = 0;
        for (key, handle) in handles {
            let (request, result) = match handle.await {
                Ok(output) => output,
                Err(e) => {
                    error!(task = %key, error = %e, "dispatch task panicked");
                    failed += 1;
                    continue;
                }
            };

            match result {
                Ok(result) => {
                    let intent = DispatchIntent::from_request(&request, Utc::now());
                    match self.record_result(&result, &intent).await {
                        Ok(()) => {
                            dispatched += 1;
                            self.reporter.report(&SchedulerEvent::Dispatched {
                                key,
                                task_id: result.id.clone(),
                                attempt: request.attempt,
                                deduped: result.deduped_from.is_some(),
                            });
                        }
                        Err(e) => {
                            failed += 1;
                            error!(task = %key, task_id = %result.id, error = %e, "failed to record dispatched task");
                        }
                    }
                }
                Err(e) => {
                    failed += 1;
                    self.handle_dispatch_error(key, &request.correlation_id, e).await;
                }
            }
        }

        (dispatched, failed)
    }

    async fn handle_dispatch_error(&self, key: TaskKey, correlation_id: &str, err: ExecutorError) {
        match &err {
            ExecutorError::Validation(message) => {
                self.store.remove_intent(correlation_id).await;
                self.report_stuck(&key, message.clone()).await;
                return;
            }
            ExecutorError::NoCapacity(_) => {
                self.store.abandon_intent(correlation_id).await;
            }
            // The task may still have been created; keep the intent so a
            // late notification or pending listing can claim it.
            _ => {}
        }

        self.reporter.report(&SchedulerEvent::DispatchFailed {
            key,
            error: err.to_string(),
            will_retry: err.is_transient(),
        });
    }

    /// Archive jobs whose derived status is terminal
    async fn archive_finished_jobs(&self) -> Result<usize> {
        let now = Utc::now();
        let mut finished = 0;
        for job in self.store.active_jobs().await {
            let status = job.derive_status();
            if !status.is_terminal() {
                continue;
            }
            if self.store.finish_job(&job.id, now).await? {
                finished += 1;
                self.reporter.report(&SchedulerEvent::JobFinished {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    status,
                });
            }
        }
        Ok(finished)
    }

    fn report_admitted(&self, id: &JobId, name: &str, revision: &str) {
        self.reporter.report(&SchedulerEvent::JobAdmitted {
            job_id: id.clone(),
            name: name.to_string(),
            revision: revision.to_string(),
        });
    }

    /// Report a key as stuck once. Returns 1 if it was newly reported.
    async fn report_stuck(&self, key: &TaskKey, reason: String) -> usize {
        if !self.stuck.lock().await.insert(key.clone()) {
            return 0;
        }
        self.reporter.report(&SchedulerEvent::Stuck {
            key: key.clone(),
            reason,
        });
        1
    }
}
