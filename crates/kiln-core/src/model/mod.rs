//! Task/job data model
//!
//! - [`TaskKey`] identifies a logical, possibly-retried unit of work
//! - [`Task`] is a single execution attempt for a key
//! - [`Job`] aggregates the attempts of every task slot one request needs
//! - [`Machine`] is a fleet worker as reported by an executor
//! - [`TaskSpec`] / [`JobSpec`] / [`Commit`] are supplied by external collaborators

mod job;
mod machine;
mod spec;
mod task;

pub use job::{Job, JobId, JobStatus, SlotState};
pub use machine::{Dimension, Machine};
pub use spec::{CacheMount, CipdPackage, Commit, CommitSpecs, JobSpec, JobTrigger, TaskSpec};
pub use task::{Task, TaskKey, TaskStatus, TaskSummary, TaskUpdate};
