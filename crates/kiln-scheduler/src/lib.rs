//! Kiln Scheduler - scheduling loop and completion protocol
//!
//! This crate turns task specs and a commit window into dispatched tasks,
//! folds backend completion notifications back into task and job state,
//! and classifies flaky failures.

pub mod candidate;
pub mod completion;
pub mod error;
pub mod flakes;
pub mod poller;
pub mod reporter;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod transport;

pub use candidate::{score, sort_candidates, Candidate};
pub use completion::{AckHandle, CompletionHandler, CompletionOutcome, CompletionPayload, Message};
pub use error::{Result, SchedulerError};
pub use flakes::{find_flaky_tasks, finished_since, flake_reports, FlakeReport};
pub use poller::CompletionPoller;
pub use reporter::{
    CollectingReporter, ReporterRegistry, SchedulerEvent, SchedulerReporter, TracingReporter,
};
pub use scheduler::{Scheduler, TickSummary};
pub use sources::{CommitSource, SpecSource, StaticSource, Workload};
pub use store::{
    DispatchIntent, PeriodicTrigger, PruneSummary, RetryRequest, StoreSnapshot, TaskStore,
    UpdateOutcome,
};
pub use transport::{ChannelTransport, Publisher, Subscription, TransportStats};
