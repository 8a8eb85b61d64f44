//! Swarming REST wire types

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringPair {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringListPair {
    pub key: String,
    #[serde(default)]
    pub value: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotInfo {
    pub bot_id: String,
    #[serde(default)]
    pub dimensions: Vec<StringListPair>,
    #[serde(default)]
    pub is_dead: bool,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotList {
    #[serde(default)]
    pub items: Vec<BotInfo>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasReference {
    #[serde(default)]
    pub cas_instance: Option<String>,
    pub digest: Digest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResultResponse {
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub created_ts: Option<String>,
    #[serde(default)]
    pub started_ts: Option<String>,
    #[serde(default)]
    pub completed_ts: Option<String>,
    #[serde(default)]
    pub abandoned_ts: Option<String>,
    #[serde(default)]
    pub modified_ts: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub cas_output_root: Option<CasReference>,
    #[serde(default)]
    pub deduped_from: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskList {
    #[serde(default)]
    pub items: Vec<TaskResultResponse>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskStates {
    #[serde(default)]
    pub states: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipdPackageWire {
    pub package_name: String,
    pub path: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CipdInput {
    pub packages: Vec<CipdPackageWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProperties {
    pub command: Vec<String>,
    pub dimensions: Vec<StringPair>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<StringPair>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_prefixes: Vec<StringListPair>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub caches: Vec<CacheEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipd_input: Option<CipdInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cas_input_root: Option<CasReference>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    pub execution_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSlice {
    pub expiration_secs: u64,
    pub properties: TaskProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskRequest {
    pub name: String,
    pub priority: u32,
    pub tags: Vec<String>,
    pub task_slices: Vec<TaskSlice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubsub_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubsub_userdata: Option<String>,
    /// Lets the server collapse client retries of the same call
    pub request_uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTaskResponse {
    pub task_id: String,
    #[serde(default)]
    pub task_result: Option<TaskResultResponse>,
}
