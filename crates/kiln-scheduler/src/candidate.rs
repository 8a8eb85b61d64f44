//! Task candidates and scoring

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use kiln_core::{Commit, Dimension, JobId, ModelError, TaskKey, TaskSpec};
use kiln_executor::{TaskRequest, POOL_DIMENSION};
use serde::Serialize;

/// A task that could be dispatched this tick
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub key: TaskKey,
    pub commit: Commit,
    #[serde(skip)]
    pub spec: TaskSpec,
    /// Jobs waiting on this key
    pub job_ids: Vec<JobId>,
    /// Highest job priority times the spec priority
    pub priority: f64,
    pub attempt: u32,
    /// Failed attempt this candidate retries
    pub retry_of: Option<String>,
    pub score: f64,
}

impl Candidate {
    /// Requested dimensions, with the default pool filled in
    pub fn dimensions(&self, default_pool: &str) -> Result<Vec<Dimension>, ModelError> {
        let mut dims = self.spec.parsed_dimensions()?;
        if Dimension::find(&dims, POOL_DIMENSION).is_none() {
            dims.push(Dimension::new(POOL_DIMENSION, default_pool));
        }
        Ok(dims)
    }

    /// Pool the candidate runs in
    pub fn pool(&self, default_pool: &str) -> String {
        self.spec
            .parsed_dimensions()
            .ok()
            .and_then(|dims| Dimension::find(&dims, POOL_DIMENSION).map(str::to_string))
            .unwrap_or_else(|| default_pool.to_string())
    }

    /// Trigger request for this candidate
    pub fn request(&self, default_pool: &str) -> Result<TaskRequest, ModelError> {
        let mut req = TaskRequest::from_spec(&self.spec, self.key.clone(), self.attempt, default_pool)?;
        req.job_ids = self.job_ids.clone();
        req.retry_of = self.retry_of.clone();
        Ok(req)
    }

    /// Compute the score at `now`
    pub fn rescore(&mut self, now: DateTime<Utc>, score_decay_24hr: f64) {
        self.score = score(self.priority, now - self.commit.timestamp, score_decay_24hr);
    }
}

/// Score of a candidate of the given priority whose commit is `age` old.
///
/// A commit loses `1 - score_decay_24hr` of its priority per day, never
/// going below zero. A decay of 1.0 disables aging.
pub fn score(priority: f64, age: chrono::Duration, score_decay_24hr: f64) -> f64 {
    let age_hours = (age.num_milliseconds().max(0) as f64) / 3_600_000.0;
    let factor = 1.0 - (1.0 - score_decay_24hr) * age_hours / 24.0;
    priority * factor.max(0.0)
}

/// Order candidates best first: score, then newer commit, then key
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.commit.timestamp.cmp(&a.commit.timestamp))
        .then_with(|| a.key.cmp(&b.key))
}

pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(compare);
}
