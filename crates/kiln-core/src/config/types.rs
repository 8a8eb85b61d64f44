//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::TaskStatus;

/// Main configuration for Kiln
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduling loop configuration
    pub scheduler: SchedulerConfig,

    /// Remote execution backend configuration
    pub executor: ExecutorConfig,

    /// Completion notification handling
    pub completion: CompletionConfig,

    /// Flake detection configuration
    pub flakes: FlakesConfig,
}

/// Scheduling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between ticks
    pub tick_interval_secs: u64,

    /// Minimum number of commits per repo to schedule over
    pub commit_window: usize,

    /// The commit window is extended to cover this much wall-clock time
    pub time_window_hours: u64,

    /// Score multiplier for a 24 hour old commit (1.0 disables time decay)
    pub score_decay_24hr: f64,

    /// Pool used when a task spec does not name one
    pub default_pool: String,

    /// Pools the scheduler dispatches to
    pub pools: Vec<String>,

    /// Maximum concurrent trigger calls per tick
    pub dispatch_concurrency: usize,

    /// Wall-clock bound on a single trigger call
    pub trigger_timeout_secs: u64,

    /// Where the task/job state snapshot is persisted
    pub state_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            commit_window: 10,
            time_window_hours: 24,
            score_decay_24hr: 0.9,
            default_pool: "default".to_string(),
            pools: vec!["default".to_string()],
            dispatch_concurrency: 8,
            trigger_timeout_secs: 60,
            state_file: Some(PathBuf::from(".kiln/state.json")),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time_window_hours * 3600)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.trigger_timeout_secs)
    }
}

/// Remote execution backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Backend type (swarming, memory)
    pub backend: String,

    /// Backend server URL
    pub server: String,

    /// Environment variable holding the bearer token
    pub auth_token_env: String,

    /// How far back pending-task queries may look
    pub pending_lookback_hours: u64,

    /// Service account tasks run as, unless the spec names one
    pub service_account: Option<String>,

    /// Topic the backend publishes completion notifications to
    pub pubsub_topic: Option<String>,

    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,

    /// In-memory backend behavior
    pub memory: MemoryBackendConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: "swarming".to_string(),
            server: "https://swarming.example.com".to_string(),
            auth_token_env: "KILN_SWARMING_TOKEN".to_string(),
            pending_lookback_hours: 48,
            service_account: None,
            pubsub_topic: None,
            request_timeout_secs: 30,
            memory: MemoryBackendConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn pending_lookback(&self) -> Duration {
        Duration::from_secs(self.pending_lookback_hours * 3600)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// How the in-memory backend runs tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBackendConfig {
    /// Start and finish tasks without outside help
    pub auto_run: bool,

    /// Seconds a started task runs before it finishes
    pub run_secs: u64,

    /// Status every auto-run task finishes with
    pub outcome: TaskStatus,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            auto_run: true,
            run_secs: 5,
            outcome: TaskStatus::Success,
        }
    }
}

impl MemoryBackendConfig {
    pub fn run_time(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }
}

/// Completion notification handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Notifications processed concurrently
    pub concurrency: usize,

    /// Seconds between completion polls for backends without push delivery
    pub poll_interval_secs: u64,

    /// Delay before a nacked notification is redelivered
    pub redelivery_delay_ms: u64,

    /// A finished task still unprocessed this long after its notification
    /// gets another one
    pub republish_after_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_secs: 10,
            redelivery_delay_ms: 500,
            republish_after_secs: 60,
        }
    }
}

impl CompletionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn republish_after(&self) -> Duration {
        Duration::from_secs(self.republish_after_secs)
    }
}

/// Flake detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlakesConfig {
    /// Trailing window of finished tasks to analyze
    pub window_days: u64,
}

impl Default for FlakesConfig {
    fn default() -> Self {
        Self { window_days: 7 }
    }
}
