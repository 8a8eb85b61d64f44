//! Default configuration values

use super::types::Config;

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "kiln.yaml";

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "kiln.toml";

/// Alternative configuration file name
pub const ALT_CONFIG_FILE: &str = ".kiln.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_YAML,
        DEFAULT_CONFIG_TOML,
        ALT_CONFIG_FILE,
        ".kiln.toml",
    ]
}

/// Render the default configuration as TOML
pub fn default_config_toml() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Kiln Configuration

scheduler:
  tick_interval_secs: 5
  commit_window: 10
  time_window_hours: 24
  score_decay_24hr: 0.9
  default_pool: default
  pools:
    - default
  dispatch_concurrency: 8
  trigger_timeout_secs: 60
  state_file: .kiln/state.json

executor:
  backend: swarming
  server: https://swarming.example.com
  auth_token_env: KILN_SWARMING_TOKEN
  pending_lookback_hours: 48
  request_timeout_secs: 30
  memory:
    auto_run: true
    run_secs: 5
    outcome: SUCCESS

completion:
  concurrency: 4
  poll_interval_secs: 10
  redelivery_delay_ms: 500
  republish_after_secs: 60

flakes:
  window_days: 7
"#;
