//! Jobs and job status derivation

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::spec::{Commit, JobTrigger};
use super::task::{TaskKey, TaskStatus, TaskSummary};
use crate::error::ModelError;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derived status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Success,
    Failure,
    Mishap,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Mishap => "MISHAP",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolution state of one task slot of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Latest attempt succeeded
    Satisfied,
    /// Not attempted yet, running, or a retry is due
    InProgress,
    /// Not attempted and can never run because a dependency terminally failed
    Blocked,
    /// Retries exhausted with only FAILURE outcomes
    Failed,
    /// Retries exhausted and at least one attempt was a MISHAP
    Mishap,
}

/// All attempts needed to satisfy one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Job spec name
    pub name: String,
    pub repo: String,
    pub revision: String,
    pub trigger: JobTrigger,
    pub priority: f64,
    pub created: DateTime<Utc>,
    /// Set once the derived status is terminal; the job is archived after that
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    /// Slot name -> slots it depends on
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Slot name -> attempts in attempt order
    pub tasks: BTreeMap<String, Vec<TaskSummary>>,
}

impl Job {
    /// Create a new job with one empty slot per dependency entry
    pub fn new(
        name: impl Into<String>,
        commit: &Commit,
        trigger: JobTrigger,
        priority: f64,
        dependencies: BTreeMap<String, Vec<String>>,
        created: DateTime<Utc>,
    ) -> Self {
        let tasks = dependencies
            .keys()
            .map(|slot| (slot.clone(), Vec::new()))
            .collect();
        Self {
            id: JobId::generate(),
            name: name.into(),
            repo: commit.repo.clone(),
            revision: commit.revision.clone(),
            trigger,
            priority,
            created,
            finished: None,
            dependencies,
            tasks,
        }
    }

    /// Whether tasks of this job are isolated from other jobs' tasks
    pub fn is_forced(&self) -> bool {
        matches!(self.trigger, JobTrigger::Manual)
    }

    /// The task key a slot of this job runs under
    pub fn task_key(&self, slot: &str) -> TaskKey {
        let key = TaskKey::new(&self.repo, &self.revision, slot);
        if self.is_forced() {
            key.with_forced_job(self.id.as_str())
        } else {
            key
        }
    }

    /// Record an attempt in a slot, replacing an existing entry with the same id
    pub fn add_attempt(&mut self, slot: &str, summary: TaskSummary) -> Result<(), ModelError> {
        let attempts = self
            .tasks
            .get_mut(slot)
            .ok_or_else(|| ModelError::UnknownSlot {
                job: self.id.to_string(),
                slot: slot.to_string(),
            })?;

        match attempts.iter_mut().find(|s| s.id == summary.id) {
            Some(existing) => *existing = summary,
            None => {
                attempts.push(summary);
                attempts.sort_by_key(|s| s.attempt);
            }
        }
        Ok(())
    }

    /// Latest attempt in a slot
    pub fn latest(&self, slot: &str) -> Option<&TaskSummary> {
        self.tasks.get(slot).and_then(|attempts| attempts.last())
    }

    /// Resolution state of every slot, in slot-name order
    pub fn slot_states(&self) -> BTreeMap<String, SlotState> {
        let mut states = BTreeMap::new();
        for slot in self.dependencies.keys() {
            self.resolve_slot(slot, &mut states, &mut Vec::new());
        }
        states
    }

    fn resolve_slot(
        &self,
        slot: &str,
        states: &mut BTreeMap<String, SlotState>,
        visiting: &mut Vec<String>,
    ) -> SlotState {
        if let Some(state) = states.get(slot) {
            return *state;
        }
        // Cycles are rejected when the dependency graph is built
        if visiting.iter().any(|s| s == slot) {
            return SlotState::Blocked;
        }

        let attempts = self.tasks.get(slot).map(Vec::as_slice).unwrap_or_default();
        let state = match attempts.last() {
            Some(latest) => own_state(latest, attempts),
            None => {
                visiting.push(slot.to_string());
                let deps = self.dependencies.get(slot).cloned().unwrap_or_default();
                let blocked = deps.iter().any(|dep| {
                    matches!(
                        self.resolve_slot(dep, states, visiting),
                        SlotState::Blocked | SlotState::Failed | SlotState::Mishap
                    )
                });
                visiting.pop();
                if blocked {
                    SlotState::Blocked
                } else {
                    SlotState::InProgress
                }
            }
        };
        states.insert(slot.to_string(), state);
        state
    }

    /// Derive the job status from its slots.
    ///
    /// Any unresolved slot keeps the job in progress. Among exhausted slots
    /// MISHAP outranks FAILURE.
    pub fn derive_status(&self) -> JobStatus {
        let states = self.slot_states();
        if states.values().any(|s| *s == SlotState::InProgress) {
            JobStatus::InProgress
        } else if states.values().any(|s| *s == SlotState::Mishap) {
            JobStatus::Mishap
        } else if states.values().any(|s| *s == SlotState::Failed) {
            JobStatus::Failure
        } else {
            JobStatus::Success
        }
    }

    /// Slots with no attempts whose dependencies are all satisfied
    pub fn ready_slots(&self) -> Vec<String> {
        let states = self.slot_states();
        self.dependencies
            .iter()
            .filter(|(slot, _)| self.tasks.get(*slot).map_or(true, Vec::is_empty))
            .filter(|(_, deps)| {
                deps.iter()
                    .all(|dep| states.get(dep) == Some(&SlotState::Satisfied))
            })
            .map(|(slot, _)| slot.clone())
            .collect()
    }
}

fn own_state(latest: &TaskSummary, attempts: &[TaskSummary]) -> SlotState {
    match latest.status {
        TaskStatus::Success => SlotState::Satisfied,
        TaskStatus::Pending | TaskStatus::Running => SlotState::InProgress,
        TaskStatus::Failure | TaskStatus::Mishap if latest.attempts_remaining() => {
            SlotState::InProgress
        }
        TaskStatus::Failure | TaskStatus::Mishap => {
            if attempts.iter().any(|a| a.status == TaskStatus::Mishap) {
                SlotState::Mishap
            } else {
                SlotState::Failed
            }
        }
    }
}
