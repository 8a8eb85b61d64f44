//! Swarming execution backend
//!
//! Talks to the Swarming REST API of a remote execution fleet.
//!
//! ## Authentication
//!
//! Requests carry a bearer token read from the environment variable named by
//! `executor.auth_token_env` (default `KILN_SWARMING_TOKEN`).
//!
//! ## Usage
//!
//! ```ignore
//! use kiln_executor::swarming::{SwarmingConfig, SwarmingExecutor};
//!
//! let executor = SwarmingExecutor::new(SwarmingConfig::from_executor_config(&config.executor))?;
//! let machines = executor.get_free_machines("Skia").await?;
//! ```

mod convert;
pub mod wire;

pub use convert::{
    build_new_task_request, convert_bot, convert_result, convert_task_status, format_timestamp,
    parse_timestamp, TIMESTAMP_FORMAT,
};

use std::time::Duration;

use chrono::Utc;
use kiln_core::config::ExecutorConfig;
use kiln_core::{Machine, TaskStatus};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, Result};
use crate::traits::TaskExecutor;
use crate::types::{PendingWindow, TaskRequest, TaskResult, DEFAULT_PENDING_LOOKBACK};
use crate::validation::validate_request;
use wire::{BotInfo, BotList, NewTaskResponse, TaskList, TaskResultResponse, TaskStates};

const API_PATH: &str = "_ah/api/swarming/v1";
const PAGE_SIZE: &str = "500";

/// Swarming backend configuration
#[derive(Debug, Clone)]
pub struct SwarmingConfig {
    /// Server URL, e.g. "https://chromium-swarm.appspot.com"
    pub server: String,

    /// Bearer token
    pub token: Option<String>,

    /// Bound on pending-task queries
    pub pending_lookback: Duration,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    /// Topic completion notifications are published to
    pub pubsub_topic: Option<String>,

    /// Service account used when a request names none
    pub service_account: Option<String>,
}

impl Default for SwarmingConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            token: None,
            pending_lookback: DEFAULT_PENDING_LOOKBACK,
            request_timeout: Duration::from_secs(30),
            pubsub_topic: None,
            service_account: None,
        }
    }
}

impl SwarmingConfig {
    /// Build from the executor section of the configuration, reading the
    /// token from the configured environment variable
    pub fn from_executor_config(config: &ExecutorConfig) -> Self {
        let token = std::env::var(&config.auth_token_env)
            .ok()
            .filter(|t| !t.is_empty());
        if token.is_some() {
            debug!(env = %config.auth_token_env, "loaded swarming token from environment");
        }

        Self {
            server: config.server.clone(),
            token,
            pending_lookback: config.pending_lookback(),
            request_timeout: config.request_timeout(),
            pubsub_topic: config.pubsub_topic.clone(),
            service_account: config.service_account.clone(),
        }
    }
}

/// Swarming REST backend
pub struct SwarmingExecutor {
    config: SwarmingConfig,
    client: Client,
}

impl SwarmingExecutor {
    /// Create a new Swarming backend
    pub fn new(config: SwarmingConfig) -> Result<Self> {
        if config.server.is_empty() {
            return Err(ExecutorError::Configuration(
                "swarming server URL is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn from_executor_config(config: &ExecutorConfig) -> Result<Self> {
        Self::new(SwarmingConfig::from_executor_config(config))
    }

    /// Whether a bearer token is configured
    pub fn is_authenticated(&self) -> bool {
        self.config.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.server.trim_end_matches('/'),
            API_PATH,
            path
        )
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.authorize(builder).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExecutorError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            ExecutorError::MalformedResponse(format!("failed to decode response: {}", e))
        })
    }

    async fn list_bots(&self, pool: &str, only_free: bool) -> Result<Vec<BotInfo>> {
        let mut bots = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("dimensions", format!("pool:{}", pool)),
                ("is_dead", "FALSE".to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            if only_free {
                query.push(("quarantined", "FALSE".to_string()));
                query.push(("is_busy", "FALSE".to_string()));
            }
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }

            let page: BotList = self
                .send(self.client.get(self.url("bots/list")).query(&query))
                .await?;
            bots.extend(page.items);

            match page.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(pool, count = bots.len(), only_free, "listed bots");
        Ok(bots)
    }

    /// Tasks in `pool` with `state`, created inside the lookback window
    async fn list_tasks(&self, pool: &str, state: &str) -> Result<Vec<TaskResult>> {
        let window = PendingWindow::ending_now(self.config.pending_lookback);
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("tags", format!("pool:{}", pool)),
                ("state", state.to_string()),
                ("start", window.start.timestamp().to_string()),
                ("end", window.end.timestamp().to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }

            let page: TaskList = self
                .send(self.client.get(self.url("tasks/list")).query(&query))
                .await?;
            for item in page.items {
                results.push(convert_result(item)?);
            }

            match page.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(pool, state, count = results.len(), "listed tasks");
        Ok(results)
    }
}

#[async_trait::async_trait]
impl TaskExecutor for SwarmingExecutor {
    fn name(&self) -> &str {
        "swarming"
    }

    async fn get_free_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        Ok(self
            .list_bots(pool, true)
            .await?
            .into_iter()
            .map(convert_bot)
            .filter(Machine::is_free)
            .collect())
    }

    async fn get_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        Ok(self
            .list_bots(pool, false)
            .await?
            .into_iter()
            .map(convert_bot)
            .filter(|m| !m.is_dead)
            .collect())
    }

    async fn get_pending_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        self.list_tasks(pool, "PENDING").await
    }

    async fn get_running_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        self.list_tasks(pool, "RUNNING").await
    }

    async fn get_task_result(&self, id: &str) -> Result<TaskResult> {
        let url = self.url(&format!("task/{}/result", id));
        let wire: TaskResultResponse = match self.send(self.client.get(url)).await {
            Err(ExecutorError::ApiError { status: 404, .. }) => {
                return Err(ExecutorError::NotFound(id.to_string()))
            }
            other => other?,
        };
        convert_result(wire)
    }

    async fn get_task_completion_statuses(&self, ids: &[String]) -> Result<Vec<bool>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query: Vec<(&str, &str)> = ids.iter().map(|id| ("task_id", id.as_str())).collect();
        let states: TaskStates = self
            .send(self.client.get(self.url("tasks/get_states")).query(&query))
            .await?;

        if states.states.len() != ids.len() {
            return Err(ExecutorError::MalformedResponse(format!(
                "asked for {} task states, got {}",
                ids.len(),
                states.states.len()
            )));
        }

        states
            .states
            .iter()
            .map(|state| convert_task_status(state, false).map(|s| s.is_terminal()))
            .collect()
    }

    async fn trigger_task(&self, req: &TaskRequest) -> Result<TaskResult> {
        validate_request(req)?;

        let body = build_new_task_request(
            req,
            self.config.pubsub_topic.as_deref(),
            self.config.service_account.as_deref(),
        );
        let response: NewTaskResponse = self
            .send(self.client.post(self.url("tasks/new")).json(&body))
            .await?;

        let result = match response.task_result {
            Some(wire) if wire.state == "NO_RESOURCE" => {
                warn!(task = %req.key, "no bots can run the task");
                return Err(ExecutorError::NoCapacity(format!(
                    "no capacity for {} in pool {}",
                    req.key,
                    req.pool().unwrap_or_default()
                )));
            }
            Some(wire) => convert_result(wire)?,
            None => TaskResult {
                id: response.task_id.clone(),
                name: req.name.clone(),
                status: TaskStatus::Pending,
                created: Utc::now(),
                started: None,
                finished: None,
                machine_id: None,
                cas_output: None,
                deduped_from: None,
                tags: req.tags(),
            },
        };

        info!(
            task_id = %result.id,
            task = %req.key,
            status = %result.status,
            "triggered swarming task"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_server() {
        let result = SwarmingExecutor::new(SwarmingConfig::default());
        assert!(matches!(result, Err(ExecutorError::Configuration(_))));
    }

    #[test]
    fn test_url() {
        let executor = SwarmingExecutor::new(SwarmingConfig {
            server: "https://swarming.example.com/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            executor.url("tasks/new"),
            "https://swarming.example.com/_ah/api/swarming/v1/tasks/new"
        );
        assert!(!executor.is_authenticated());
    }

    #[test]
    fn test_from_executor_config_reads_token() {
        let config = ExecutorConfig {
            auth_token_env: "KILN_TEST_SWARMING_TOKEN_FROM_CONFIG".to_string(),
            pending_lookback_hours: 12,
            ..Default::default()
        };
        std::env::set_var("KILN_TEST_SWARMING_TOKEN_FROM_CONFIG", "secret");

        let swarming = SwarmingConfig::from_executor_config(&config);
        assert_eq!(swarming.token.as_deref(), Some("secret"));
        assert_eq!(swarming.pending_lookback, Duration::from_secs(12 * 3600));

        std::env::remove_var("KILN_TEST_SWARMING_TOKEN_FROM_CONFIG");
    }

    #[tokio::test]
    async fn test_trigger_validates_before_network() {
        // Nothing listens on this address; validation must fail first.
        let executor = SwarmingExecutor::new(SwarmingConfig {
            server: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        })
        .unwrap();

        let req = TaskRequest {
            command: Vec::new(),
            ..sample_request()
        };
        let err = executor.trigger_task(&req).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Validation(_)));
    }

    fn sample_request() -> TaskRequest {
        let spec = kiln_core::TaskSpec {
            command: vec!["run".to_string()],
            ..Default::default()
        };
        TaskRequest::from_spec(&spec, kiln_core::TaskKey::new("r", "abc", "t"), 0, "ci").unwrap()
    }
}
