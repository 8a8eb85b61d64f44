//! Commit window and task-spec collaborators

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use kiln_core::{Commit, CommitSpecs, Dimension, Machine};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Provides the commits the scheduler works over
#[async_trait::async_trait]
pub trait CommitSource: Send + Sync {
    /// Commits in the window, newest first.
    ///
    /// Per repository the window holds at least `min_commits` commits and is
    /// extended to include every commit newer than `time_window`.
    async fn commits(&self, min_commits: usize, time_window: Duration) -> Result<Vec<Commit>>;
}

/// Provides the task and job specs applicable at a commit
#[async_trait::async_trait]
pub trait SpecSource: Send + Sync {
    async fn specs(&self, commit: &Commit) -> Result<CommitSpecs>;
}

/// A workload file: commits plus the specs that apply to them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workload {
    pub commits: Vec<Commit>,

    /// Specs used at every commit without an override
    pub specs: CommitSpecs,

    /// Revision -> specs that apply at that revision only
    pub overrides: HashMap<String, CommitSpecs>,

    /// Machines for the in-memory backend: id -> `key:value` dimensions
    pub machines: BTreeMap<String, Vec<String>>,
}

impl Workload {
    /// Load a workload from YAML or JSON, picked by file extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let workload: Workload = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        debug!(path = %path.display(), "loaded workload");
        Ok(workload)
    }

    /// Parse the machine list
    pub fn fleet(&self) -> Result<Vec<Machine>> {
        self.machines
            .iter()
            .map(|(id, dims)| -> Result<Machine> {
                let dims = dims
                    .iter()
                    .map(|d| d.parse::<Dimension>())
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Machine::new(id.as_str(), &dims))
            })
            .collect()
    }
}

/// Serves a fixed [`Workload`] as both commit and spec source
#[derive(Debug, Default)]
pub struct StaticSource {
    workload: RwLock<Workload>,
}

impl StaticSource {
    pub fn new(workload: Workload) -> Self {
        Self {
            workload: RwLock::new(workload),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(Workload::load(path)?))
    }

    /// Add a commit to the window
    pub async fn push_commit(&self, commit: Commit) {
        self.workload.write().await.commits.push(commit);
    }
}

#[async_trait::async_trait]
impl CommitSource for StaticSource {
    async fn commits(&self, min_commits: usize, time_window: Duration) -> Result<Vec<Commit>> {
        let workload = self.workload.read().await;
        let window = chrono::Duration::from_std(time_window)
            .map_err(|e| SchedulerError::Source(format!("invalid time window: {}", e)))?;
        let cutoff = Utc::now() - window;

        let mut by_repo: BTreeMap<&str, Vec<&Commit>> = BTreeMap::new();
        for commit in &workload.commits {
            by_repo.entry(commit.repo.as_str()).or_default().push(commit);
        }

        let mut window: Vec<Commit> = Vec::new();
        for commits in by_repo.values_mut() {
            commits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            window.extend(
                commits
                    .iter()
                    .enumerate()
                    .take_while(|(i, c)| *i < min_commits || c.timestamp >= cutoff)
                    .map(|(_, c)| (*c).clone()),
            );
        }

        window.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.repo.cmp(&b.repo))
        });
        Ok(window)
    }
}

#[async_trait::async_trait]
impl SpecSource for StaticSource {
    async fn specs(&self, commit: &Commit) -> Result<CommitSpecs> {
        let workload = self.workload.read().await;
        Ok(workload
            .overrides
            .get(&commit.revision)
            .unwrap_or(&workload.specs)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn commit(repo: &str, rev: &str, hours_ago: i64) -> Commit {
        Commit::new(repo, rev, Utc::now() - chrono::Duration::hours(hours_ago))
    }

    #[tokio::test]
    async fn test_window_keeps_min_commits() {
        let source = StaticSource::new(Workload {
            commits: vec![
                commit("a", "a1", 100),
                commit("a", "a2", 90),
                commit("a", "a3", 80),
                commit("b", "b1", 1),
            ],
            ..Default::default()
        });

        let window = source.commits(2, Duration::from_secs(3600 * 24)).await.unwrap();
        let revisions: Vec<&str> = window.iter().map(|c| c.revision.as_str()).collect();
        assert_eq!(revisions, vec!["b1", "a3", "a2"]);
    }

    #[tokio::test]
    async fn test_window_extends_to_time_window() {
        let source = StaticSource::new(Workload {
            commits: (0..5).map(|i| commit("a", &format!("r{}", i), i)).collect(),
            ..Default::default()
        });

        let window = source.commits(1, Duration::from_secs(3600 * 3 + 60)).await.unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].revision, "r0");
    }

    #[tokio::test]
    async fn test_spec_overrides() {
        let mut special = CommitSpecs::default();
        special
            .tasks
            .insert("only-here".to_string(), Default::default());
        let mut overrides = HashMap::new();
        overrides.insert("r2".to_string(), special);

        let source = StaticSource::new(Workload {
            overrides,
            ..Default::default()
        });

        let specs = source.specs(&commit("a", "r2", 0)).await.unwrap();
        assert!(specs.tasks.contains_key("only-here"));
        let specs = source.specs(&commit("a", "r1", 0)).await.unwrap();
        assert!(specs.tasks.is_empty());
    }

    #[test]
    fn test_fleet_rejects_bad_dimension() {
        let mut workload = Workload::default();
        workload
            .machines
            .insert("bot-1".to_string(), vec!["nocolon".to_string()]);
        assert!(matches!(workload.fleet(), Err(SchedulerError::Model(_))));
    }

    #[test]
    fn test_load_yaml_workload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("workload.yaml");
        std::fs::write(
            &path,
            r#"
commits:
  - repo: skia
    revision: abc123
    timestamp: "2024-03-01T12:00:00Z"
specs:
  tasks:
    build:
      dimensions: ["os:Linux"]
      command: ["make"]
    test:
      dependencies: [build]
      command: ["make", "test"]
  jobs:
    ci:
      tasks: [test]
    nightly-perf:
      tasks: [build]
      trigger: "periodic:nightly"
machines:
  bot-1: ["pool:ci", "os:Linux"]
  bot-2: ["pool:ci", "os:Mac"]
"#,
        )
        .unwrap();

        let workload = Workload::load(&path).unwrap();
        assert_eq!(workload.commits.len(), 1);
        let fleet = workload.fleet().unwrap();
        assert_eq!(fleet.len(), 2);
        assert!(fleet[0].satisfies(&[Dimension::new("os", "Linux")]));
        assert_eq!(workload.specs.tasks.len(), 2);
        assert_eq!(workload.specs.jobs.len(), 2);
    }
}
