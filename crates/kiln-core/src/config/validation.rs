//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Executor backends the CLI knows how to build
pub const VALID_BACKENDS: [&str; 2] = ["swarming", "memory"];

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_scheduler(config)?;
    validate_executor(config)?;
    validate_completion(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

fn validate_scheduler(config: &Config) -> Result<()> {
    let scheduler = &config.scheduler;

    if !(0.0..=1.0).contains(&scheduler.score_decay_24hr) {
        return Err(invalid("scheduler.score_decay_24hr", "must be between 0.0 and 1.0").into());
    }

    if scheduler.commit_window == 0 {
        return Err(invalid("scheduler.commit_window", "must be at least 1").into());
    }

    if scheduler.tick_interval_secs == 0 {
        return Err(invalid("scheduler.tick_interval_secs", "must be at least 1").into());
    }

    if scheduler.dispatch_concurrency == 0 {
        return Err(invalid("scheduler.dispatch_concurrency", "must be at least 1").into());
    }

    if scheduler.trigger_timeout_secs == 0 {
        return Err(invalid("scheduler.trigger_timeout_secs", "must be at least 1").into());
    }

    if scheduler.pools.is_empty() {
        return Err(invalid("scheduler.pools", "at least one pool is required").into());
    }

    if scheduler.pools.iter().any(|p| p.is_empty()) {
        return Err(invalid("scheduler.pools", "pool names cannot be empty").into());
    }

    if !scheduler.pools.contains(&scheduler.default_pool) {
        return Err(invalid(
            "scheduler.default_pool",
            format!("must be one of: {}", scheduler.pools.join(", ")),
        )
        .into());
    }

    Ok(())
}

fn validate_executor(config: &Config) -> Result<()> {
    let executor = &config.executor;

    if !VALID_BACKENDS.contains(&executor.backend.as_str()) {
        return Err(invalid(
            "executor.backend",
            format!("must be one of: {}", VALID_BACKENDS.join(", ")),
        )
        .into());
    }

    if executor.backend == "swarming" && executor.server.is_empty() {
        return Err(invalid("executor.server", "server cannot be empty").into());
    }

    if executor.pending_lookback_hours == 0 {
        return Err(invalid("executor.pending_lookback_hours", "must be at least 1").into());
    }

    if executor.memory.auto_run && !executor.memory.outcome.is_terminal() {
        return Err(invalid(
            "executor.memory.outcome",
            "must be SUCCESS, FAILURE or MISHAP",
        )
        .into());
    }

    Ok(())
}

fn validate_completion(config: &Config) -> Result<()> {
    if config.completion.concurrency == 0 {
        return Err(invalid("completion.concurrency", "must be at least 1").into());
    }

    if config.completion.poll_interval_secs == 0 {
        return Err(invalid("completion.poll_interval_secs", "must be at least 1").into());
    }

    if config.completion.republish_after_secs == 0 {
        return Err(invalid("completion.republish_after_secs", "must be at least 1").into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_decay_range() {
        let mut config = Config::default();
        config.scheduler.score_decay_24hr = 1.0;
        assert!(validate_config(&config).is_ok());
        config.scheduler.score_decay_24hr = -0.1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_default_pool_must_be_listed() {
        let mut config = Config::default();
        config.scheduler.default_pool = "other".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_invalid_backend() {
        let mut config = Config::default();
        config.executor.backend = "kubernetes".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = Config::default();
        config.scheduler.dispatch_concurrency = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.completion.concurrency = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_memory_outcome_is_terminal() {
        let mut config = Config::default();
        config.executor.memory.outcome = crate::model::TaskStatus::Running;
        assert!(validate_config(&config).is_err());

        config.executor.memory.auto_run = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_republish_after() {
        let mut config = Config::default();
        config.completion.republish_after_secs = 0;
        assert!(validate_config(&config).is_err());
    }
}
