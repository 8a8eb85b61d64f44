//! Local request validation, run before any backend call

use std::collections::HashSet;

use crate::error::{ExecutorError, Result};
use crate::types::{TaskRequest, POOL_DIMENSION};

/// Validate a request before it is sent to a backend
pub fn validate_request(req: &TaskRequest) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(invalid("task name is required"));
    }

    if req.command.is_empty() || req.command.iter().all(|arg| arg.is_empty()) {
        return Err(invalid(format!("task '{}' has an empty command", req.name)));
    }

    if req.correlation_id.is_empty() {
        return Err(invalid(format!("task '{}' has no correlation id", req.name)));
    }

    let mut seen = HashSet::new();
    for dim in &req.dimensions {
        if !seen.insert(dim.key.as_str()) {
            return Err(invalid(format!(
                "task '{}' has duplicate dimension key '{}'",
                req.name, dim.key
            )));
        }
    }

    if !seen.contains(POOL_DIMENSION) {
        return Err(invalid(format!(
            "task '{}' is missing the '{}' dimension",
            req.name, POOL_DIMENSION
        )));
    }

    if let Some(cas) = &req.cas_input {
        let valid = cas
            .split_once('/')
            .is_some_and(|(hash, size)| !hash.is_empty() && size.parse::<u64>().is_ok());
        if !valid {
            return Err(invalid(format!(
                "task '{}' has CAS input '{}', expected hash/size",
                req.name, cas
            )));
        }
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ExecutorError {
    ExecutorError::Validation(message.into())
}
