//! Conversion between kiln types and the Swarming wire format

use chrono::{DateTime, NaiveDateTime, Utc};
use kiln_core::{Machine, TaskStatus};

use super::wire::*;
use crate::error::{ExecutorError, Result};
use crate::types::{TaskRequest, TaskResult, TaskTags};

/// Timestamp layout used by the Swarming API (always UTC)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Map a Swarming task state to a task status.
///
/// Every backend-side failure to run the work is a MISHAP. Unknown states
/// are an error rather than a guess.
pub fn convert_task_status(state: &str, failure: bool) -> Result<TaskStatus> {
    match state {
        "PENDING" => Ok(TaskStatus::Pending),
        "RUNNING" => Ok(TaskStatus::Running),
        "COMPLETED" if failure => Ok(TaskStatus::Failure),
        "COMPLETED" => Ok(TaskStatus::Success),
        "BOT_DIED" | "CANCELED" | "CLIENT_ERROR" | "EXPIRED" | "NO_RESOURCE" | "TIMED_OUT"
        | "KILLED" => Ok(TaskStatus::Mishap),
        other => Err(ExecutorError::UnknownState(other.to_string())),
    }
}

pub fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    let trimmed = ts.strip_suffix('Z').unwrap_or(ts);
    NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| ExecutorError::MalformedResponse(format!("timestamp '{}': {}", ts, e)))
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn optional_timestamp(ts: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    match ts.as_deref() {
        None | Some("") => Ok(None),
        Some(ts) => parse_timestamp(ts).map(Some),
    }
}

/// Parse a `hash/size` CAS digest
pub fn parse_cas_digest(digest: &str) -> Option<CasReference> {
    let (hash, size) = digest.split_once('/')?;
    Some(CasReference {
        cas_instance: None,
        digest: Digest {
            hash: hash.to_string(),
            size_bytes: size.parse().ok()?,
        },
    })
}

pub fn convert_bot(bot: BotInfo) -> Machine {
    Machine {
        id: bot.bot_id,
        dimensions: bot
            .dimensions
            .into_iter()
            .map(|pair| (pair.key, pair.value))
            .collect(),
        is_dead: bot.is_dead,
        is_quarantined: bot.quarantined,
        current_task_id: bot.task_id.filter(|id| !id.is_empty()),
    }
}

pub fn convert_result(wire: TaskResultResponse) -> Result<TaskResult> {
    let status = convert_task_status(&wire.state, wire.failure)?;

    let created = optional_timestamp(&wire.created_ts)?.ok_or_else(|| {
        ExecutorError::MalformedResponse(format!("task {} has no created_ts", wire.task_id))
    })?;
    let started = optional_timestamp(&wire.started_ts)?;

    let finished = if status.is_terminal() {
        let ts = optional_timestamp(&wire.completed_ts)?
            .or(optional_timestamp(&wire.abandoned_ts)?)
            .or(optional_timestamp(&wire.modified_ts)?);
        Some(ts.ok_or_else(|| {
            ExecutorError::MalformedResponse(format!(
                "task {} is {} without a completion time",
                wire.task_id, wire.state
            ))
        })?)
    } else {
        None
    };

    let tags = TaskTags::parse(&wire.tags)?;

    Ok(TaskResult {
        id: wire.task_id,
        name: wire.name,
        status,
        created,
        started,
        finished,
        machine_id: wire.bot_id.filter(|id| !id.is_empty()),
        cas_output: wire
            .cas_output_root
            .map(|cas| format!("{}/{}", cas.digest.hash, cas.digest.size_bytes)),
        deduped_from: wire.deduped_from.filter(|id| !id.is_empty()),
        tags,
    })
}

/// Build the `tasks/new` body for a request
pub fn build_new_task_request(
    req: &TaskRequest,
    pubsub_topic: Option<&str>,
    default_service_account: Option<&str>,
) -> NewTaskRequest {
    let mut tags = req.tags().to_strings();
    tags.extend(req.dimensions.iter().map(|d| d.to_string()));

    let cipd_input = (!req.cipd_packages.is_empty()).then(|| CipdInput {
        packages: req
            .cipd_packages
            .iter()
            .map(|p| CipdPackageWire {
                package_name: p.name.clone(),
                path: p.path.clone(),
                version: p.version.clone(),
            })
            .collect(),
    });

    let properties = TaskProperties {
        command: req.command.clone(),
        dimensions: req
            .dimensions
            .iter()
            .map(|d| StringPair {
                key: d.key.clone(),
                value: d.value.clone(),
            })
            .collect(),
        env: req
            .env
            .iter()
            .map(|(key, value)| StringPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        env_prefixes: req
            .env_prefixes
            .iter()
            .map(|(key, value)| StringListPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        caches: req
            .caches
            .iter()
            .map(|c| CacheEntry {
                name: c.name.clone(),
                path: c.path.clone(),
            })
            .collect(),
        cipd_input,
        cas_input_root: req.cas_input.as_deref().and_then(parse_cas_digest),
        outputs: req.outputs.clone(),
        execution_timeout_secs: req.effective_execution_timeout().as_secs(),
        io_timeout_secs: req.effective_io_timeout().as_secs(),
        idempotent: req.idempotent,
    };

    NewTaskRequest {
        name: req.name.clone(),
        priority: req.priority,
        tags,
        task_slices: vec![TaskSlice {
            expiration_secs: req.effective_expiration().as_secs(),
            properties,
        }],
        service_account: req
            .service_account
            .clone()
            .or_else(|| default_service_account.map(str::to_string)),
        pubsub_topic: pubsub_topic.map(str::to_string),
        pubsub_userdata: pubsub_topic.map(|_| req.correlation_id.clone()),
        request_uuid: req.correlation_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{TaskKey, TaskSpec};

    #[test]
    fn test_status_mapping_is_total() {
        let mishaps = [
            "BOT_DIED",
            "CANCELED",
            "CLIENT_ERROR",
            "EXPIRED",
            "NO_RESOURCE",
            "TIMED_OUT",
            "KILLED",
        ];
        for state in mishaps {
            assert_eq!(convert_task_status(state, false).unwrap(), TaskStatus::Mishap);
            assert_eq!(convert_task_status(state, true).unwrap(), TaskStatus::Mishap);
        }
        assert_eq!(convert_task_status("PENDING", false).unwrap(), TaskStatus::Pending);
        assert_eq!(convert_task_status("RUNNING", false).unwrap(), TaskStatus::Running);
        assert_eq!(convert_task_status("COMPLETED", false).unwrap(), TaskStatus::Success);
        assert_eq!(convert_task_status("COMPLETED", true).unwrap(), TaskStatus::Failure);
    }

    #[test]
    fn test_unknown_state_fails_closed() {
        let err = convert_task_status("EXPLODED", false).unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownState(s) if s == "EXPLODED"));
    }

    #[test]
    fn test_timestamps() {
        let ts = parse_timestamp("2024-03-01T12:30:45.123456").unwrap();
        assert_eq!(format_timestamp(ts), "2024-03-01T12:30:45.123456");

        let ts = parse_timestamp("2024-03-01T12:30:45").unwrap();
        assert_eq!(ts.timestamp() % 60, 45);

        assert!(parse_timestamp("yesterday").is_err());
    }

    fn wire(state: &str) -> TaskResultResponse {
        TaskResultResponse {
            task_id: "abc123".to_string(),
            name: "test".to_string(),
            state: state.to_string(),
            created_ts: Some("2024-03-01T12:00:00".to_string()),
            started_ts: Some("2024-03-01T12:01:00".to_string()),
            completed_ts: Some("2024-03-01T12:05:00.5".to_string()),
            bot_id: Some("bot-1".to_string()),
            tags: vec![
                "kiln-repo:skia".to_string(),
                "kiln-revision:deadbeef".to_string(),
                "kiln-name:test".to_string(),
                "kiln-attempt:1".to_string(),
                "kiln-correlation-id:c-1".to_string(),
                "os:Linux".to_string(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_convert_result() {
        let mut completed = wire("COMPLETED");
        completed.failure = true;
        completed.cas_output_root = parse_cas_digest("ff00/42");

        let result = convert_result(completed).unwrap();
        assert_eq!(result.status, TaskStatus::Failure);
        assert_eq!(result.machine_id.as_deref(), Some("bot-1"));
        assert_eq!(result.cas_output.as_deref(), Some("ff00/42"));
        assert_eq!(result.tags.key, Some(TaskKey::new("skia", "deadbeef", "test")));
        assert_eq!(result.tags.attempt, Some(1));
        assert!(result.finished.is_some());
    }

    #[test]
    fn test_convert_result_expired_uses_abandoned_ts() {
        let mut expired = wire("EXPIRED");
        expired.started_ts = None;
        expired.completed_ts = None;
        expired.abandoned_ts = Some("2024-03-01T16:00:00".to_string());
        let result = convert_result(expired).unwrap();
        assert_eq!(result.status, TaskStatus::Mishap);
        assert!(result.finished.is_some());

        let mut broken = wire("KILLED");
        broken.completed_ts = None;
        assert!(matches!(
            convert_result(broken),
            Err(ExecutorError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_convert_result_malformed_tags() {
        let mut bad = wire("PENDING");
        bad.tags.push("kiln-attempt:x".to_string());
        assert!(matches!(
            convert_result(bad),
            Err(ExecutorError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_build_new_task_request() {
        let spec = TaskSpec {
            dimensions: vec!["os:Linux".to_string()],
            command: vec!["run".to_string()],
            cas_input: Some("abcd/12".to_string()),
            ..Default::default()
        };
        let req =
            TaskRequest::from_spec(&spec, TaskKey::new("skia", "deadbeef", "test"), 0, "ci")
                .unwrap();

        let body = build_new_task_request(&req, Some("projects/p/topics/t"), Some("sa@p"));
        assert_eq!(body.request_uuid, req.correlation_id);
        assert_eq!(body.pubsub_userdata.as_deref(), Some(req.correlation_id.as_str()));
        assert_eq!(body.service_account.as_deref(), Some("sa@p"));
        assert_eq!(body.task_slices[0].expiration_secs, 4 * 60 * 60);
        assert_eq!(body.task_slices[0].properties.io_timeout_secs, 20 * 60);
        assert!(body.tags.contains(&"kiln-name:test".to_string()));
        assert!(body.tags.contains(&"pool:ci".to_string()));
        let cas = body.task_slices[0].properties.cas_input_root.as_ref().unwrap();
        assert_eq!(cas.digest.size_bytes, 12);
    }

    #[test]
    fn test_convert_bot() {
        let bot = BotInfo {
            bot_id: "bot-1".to_string(),
            dimensions: vec![StringListPair {
                key: "os".to_string(),
                value: vec!["Linux".to_string(), "Ubuntu".to_string()],
            }],
            task_id: Some(String::new()),
            ..Default::default()
        };
        let machine = convert_bot(bot);
        assert!(machine.is_free());
        assert!(machine.satisfies(&[kiln_core::Dimension::new("os", "Ubuntu")]));
    }
}
