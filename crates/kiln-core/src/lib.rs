//! Kiln Core - data model and configuration for the Kiln task scheduler
//!
//! This crate provides the task/job vocabulary shared by the executor and
//! scheduler crates: task keys, task attempts, job status derivation,
//! machines and the specs handed to the scheduler by external collaborators.

pub mod config;
pub mod error;
pub mod model;

pub use error::{ConfigError, KilnError, ModelError, Result};
pub use model::{
    Commit, CommitSpecs, Dimension, Job, JobId, JobSpec, JobStatus, JobTrigger, Machine,
    SlotState, Task, TaskKey, TaskSpec, TaskStatus, TaskSummary, TaskUpdate,
};
