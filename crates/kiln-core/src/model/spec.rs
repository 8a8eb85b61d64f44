//! Commits and task/job specs supplied by external collaborators

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::machine::Dimension;
use crate::error::ModelError;

/// A commit in the scheduling window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub repo: String,
    pub revision: String,
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            timestamp,
        }
    }
}

/// A named cache mounted into the task's working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMount {
    pub name: String,
    pub path: String,
}

/// A pinned package installed before the task runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipdPackage {
    pub name: String,
    pub path: String,
    pub version: String,
}

/// How a job gets admitted
///
/// Serialized as `any_commit`, `manual` or `periodic:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum JobTrigger {
    /// Run at every commit in the window
    #[default]
    AnyCommit,
    /// Run when the named periodic trigger fires (e.g. "nightly")
    Periodic(String),
    /// Run only when forced by a user
    Manual,
}

impl fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnyCommit => write!(f, "any_commit"),
            Self::Periodic(name) => write!(f, "periodic:{}", name),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl TryFrom<String> for JobTrigger {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "any_commit" | "" => Ok(Self::AnyCommit),
            "manual" => Ok(Self::Manual),
            other => match other.strip_prefix("periodic:") {
                Some(name) if !name.is_empty() => Ok(Self::Periodic(name.to_string())),
                _ => Err(format!("Unknown job trigger: {}", other)),
            },
        }
    }
}

impl From<JobTrigger> for String {
    fn from(trigger: JobTrigger) -> Self {
        trigger.to_string()
    }
}

/// Definition of one schedulable task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// Other task specs that must succeed first
    pub dependencies: Vec<String>,

    /// Capability requirements as `key:value` strings
    pub dimensions: Vec<String>,

    /// Command line to run
    pub command: Vec<String>,

    /// Environment variables
    pub env: BTreeMap<String, String>,

    /// Paths prepended to environment variables (e.g. PATH)
    pub env_prefixes: BTreeMap<String, Vec<String>>,

    /// Named caches
    pub caches: Vec<CacheMount>,

    /// Package pins
    pub cipd_packages: Vec<CipdPackage>,

    /// Content-addressed input root digest
    pub cas_input: Option<String>,

    /// Output paths collected after the run
    pub outputs: Vec<String>,

    /// Whether the backend may serve a cached result
    pub idempotent: bool,

    /// Retry budget
    pub max_attempts: u32,

    /// Base score multiplier
    pub priority: f64,

    /// Zero means the backend default
    pub expiration_secs: u64,
    pub execution_timeout_secs: u64,
    pub io_timeout_secs: u64,

    pub service_account: Option<String>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            dependencies: Vec::new(),
            dimensions: Vec::new(),
            command: Vec::new(),
            env: BTreeMap::new(),
            env_prefixes: BTreeMap::new(),
            caches: Vec::new(),
            cipd_packages: Vec::new(),
            cas_input: None,
            outputs: Vec::new(),
            idempotent: false,
            max_attempts: 2,
            priority: 1.0,
            expiration_secs: 0,
            execution_timeout_secs: 0,
            io_timeout_secs: 0,
            service_account: None,
        }
    }
}

impl TaskSpec {
    /// Parse the dimension strings
    pub fn parsed_dimensions(&self) -> Result<Vec<Dimension>, ModelError> {
        self.dimensions.iter().map(|d| d.parse()).collect()
    }
}

/// Definition of a job: a set of root task specs plus how it is triggered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    /// Root task specs; their dependencies are pulled in transitively
    pub tasks: Vec<String>,
    pub trigger: JobTrigger,
    pub priority: f64,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            trigger: JobTrigger::AnyCommit,
            priority: 1.0,
        }
    }
}

/// Every task and job spec applicable at one commit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSpecs {
    pub tasks: HashMap<String, TaskSpec>,
    pub jobs: HashMap<String, JobSpec>,
}

impl CommitSpecs {
    /// Compute the slot graph of a job: every task spec reachable from its
    /// roots, mapped to its direct dependencies.
    pub fn dependency_closure(
        &self,
        job_name: &str,
        job: &JobSpec,
    ) -> Result<BTreeMap<String, Vec<String>>, ModelError> {
        let mut graph = BTreeMap::new();
        let mut stack: Vec<String> = job.tasks.clone();

        while let Some(name) = stack.pop() {
            if graph.contains_key(&name) {
                continue;
            }
            let spec = self
                .tasks
                .get(&name)
                .ok_or_else(|| ModelError::UnknownTaskSpec {
                    job: job_name.to_string(),
                    task: name.clone(),
                })?;
            stack.extend(spec.dependencies.iter().cloned());
            graph.insert(name, spec.dependencies.clone());
        }

        check_acyclic(&graph)?;
        Ok(graph)
    }
}

fn check_acyclic(graph: &BTreeMap<String, Vec<String>>) -> Result<(), ModelError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        graph: &'a BTreeMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), ModelError> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(ModelError::DependencyCycle(node.to_string())),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        for dep in graph.get(node).into_iter().flatten() {
            visit(dep, graph, marks)?;
        }
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for node in graph.keys() {
        visit(node, graph, &mut marks)?;
    }
    Ok(())
}
