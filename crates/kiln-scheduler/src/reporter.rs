//! Scheduler event reporting

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kiln_core::{JobId, JobStatus, TaskKey};

/// Events emitted by the scheduling loop
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A job was created for a commit, periodic trigger or force request
    JobAdmitted {
        job_id: JobId,
        name: String,
        revision: String,
    },
    /// A task attempt was triggered on the backend
    Dispatched {
        key: TaskKey,
        task_id: String,
        attempt: u32,
        deduped: bool,
    },
    /// A trigger call failed
    DispatchFailed {
        key: TaskKey,
        error: String,
        will_retry: bool,
    },
    /// A candidate can never be scheduled as specified
    Stuck { key: TaskKey, reason: String },
    /// A job reached a terminal status and was archived
    JobFinished {
        job_id: JobId,
        name: String,
        status: JobStatus,
    },
    /// A tick finished
    TickCompleted {
        candidates: usize,
        dispatched: usize,
        failed: usize,
        duration: Duration,
    },
}

/// Trait for reporting scheduler progress
pub trait SchedulerReporter: Send + Sync {
    /// Handle a scheduler event
    fn report(&self, event: &SchedulerEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl SchedulerReporter for TracingReporter {
    fn report(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::JobAdmitted {
                job_id,
                name,
                revision,
            } => {
                tracing::info!(%job_id, job = %name, %revision, "job admitted");
            }
            SchedulerEvent::Dispatched {
                key,
                task_id,
                attempt,
                deduped,
            } => {
                tracing::info!(task = %key, %task_id, attempt, deduped, "task dispatched");
            }
            SchedulerEvent::DispatchFailed {
                key,
                error,
                will_retry,
            } => {
                if *will_retry {
                    tracing::warn!(task = %key, %error, "dispatch failed, retrying next tick");
                } else {
                    tracing::error!(task = %key, %error, "dispatch failed");
                }
            }
            SchedulerEvent::Stuck { key, reason } => {
                tracing::error!(task = %key, %reason, "task cannot be scheduled");
            }
            SchedulerEvent::JobFinished {
                job_id,
                name,
                status,
            } => {
                tracing::info!(%job_id, job = %name, %status, "job finished");
            }
            SchedulerEvent::TickCompleted {
                candidates,
                dispatched,
                failed,
                duration,
            } => {
                tracing::info!(
                    candidates,
                    dispatched,
                    failed,
                    "tick complete in {:.2}s",
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<SchedulerEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Keys reported as stuck, in report order
    pub fn stuck_keys(&self) -> Vec<TaskKey> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SchedulerEvent::Stuck { key, .. } => Some(key),
                _ => None,
            })
            .collect()
    }
}

impl SchedulerReporter for CollectingReporter {
    fn report(&self, event: &SchedulerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Registry of scheduler reporters
pub struct ReporterRegistry {
    reporters: Vec<Arc<dyn SchedulerReporter>>,
}

impl ReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: SchedulerReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn all(&self) -> &[Arc<dyn SchedulerReporter>] {
        &self.reporters
    }
}

impl Default for ReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerReporter for ReporterRegistry {
    /// Broadcast an event to all registered reporters
    fn report(&self, event: &SchedulerEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TaskKey {
        TaskKey::new("repo", "abc", "build")
    }

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();

        reporter.report(&SchedulerEvent::Dispatched {
            key: key(),
            task_id: "t1".to_string(),
            attempt: 0,
            deduped: false,
        });
        reporter.report(&SchedulerEvent::Stuck {
            key: key(),
            reason: "no machine has gpu:none".to_string(),
        });

        assert_eq!(reporter.events().len(), 2);
        assert_eq!(reporter.stuck_keys(), vec![key()]);
    }

    #[test]
    fn test_tracing_reporter() {
        let reporter = TracingReporter;

        // Just verify it doesn't panic
        reporter.report(&SchedulerEvent::DispatchFailed {
            key: key(),
            error: "timed out".to_string(),
            will_retry: true,
        });
        reporter.report(&SchedulerEvent::TickCompleted {
            candidates: 3,
            dispatched: 2,
            failed: 1,
            duration: Duration::from_millis(20),
        });
    }

    #[test]
    fn test_registry_broadcast() {
        let collecting = Arc::new(CollectingReporter::default());
        let mut registry = ReporterRegistry::empty();
        assert!(registry.all().is_empty());
        registry.reporters.push(collecting.clone());
        registry.register(TracingReporter);
        assert_eq!(registry.all().len(), 2);

        registry.report(&SchedulerEvent::Stuck {
            key: key(),
            reason: "invalid dimension".to_string(),
        });
        assert_eq!(collecting.events().len(), 1);
    }
}
