//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::config_file_names;
use super::types::Config;
use super::validation::validate_config;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Load and validate a configuration file. `.toml` files are parsed as TOML,
/// anything else as YAML.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: Config = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(ConfigError::TomlError)?,
        _ => serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?,
    };

    validate_config(&config)?;
    info!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Find a configuration file in `start_dir` or its ancestors.
///
/// Each directory is checked for every known file name, first directly and
/// then under `.github/`. The nearest match wins.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");

    for dir in start_dir.ancestors() {
        for name in config_file_names() {
            for candidate in [dir.join(name), dir.join(".github").join(name)] {
                if candidate.is_file() {
                    debug!(path = %candidate.display(), "found config file");
                    return Some(candidate);
                }
            }
        }
    }

    debug!("no config file found");
    None
}

fn resolve_config_path(dir: &Path, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) if path.is_file() => Ok(path),
        Some(path) => Err(ConfigError::NotFound(path).into()),
        None => find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()).into()),
    }
}

/// Load configuration from `$KILN_CONFIG`, else by searching from `dir`
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config_path = resolve_config_path(dir, explicit)?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

/// Load configuration, falling back to defaults when none is found.
///
/// A config file that exists but fails to load is logged and replaced by
/// defaults as well.
pub fn load_config_or_default(dir: &Path) -> (Config, Option<PathBuf>) {
    match load_config_from_dir(dir) {
        Ok((config, path)) => (config, Some(path)),
        Err(crate::KilnError::Config(ConfigError::NotFound(_))) => {
            warn!(dir = %dir.display(), "no config found, using defaults");
            (Config::default(), None)
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "invalid config, using defaults");
            (Config::default(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kiln.toml");
        std::fs::write(&config_path, "[scheduler]\ncommit_window = 5").unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_yaml_over_toml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("kiln.toml");
        let yaml_path = temp.path().join("kiln.yaml");
        std::fs::write(&toml_path, "[scheduler]\ncommit_window = 5").unwrap();
        std::fs::write(&yaml_path, "scheduler:\n  commit_window: 5").unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, yaml_path);
    }

    #[test]
    fn test_find_config_in_github_dir() {
        let temp = TempDir::new().unwrap();
        let github_dir = temp.path().join(".github");
        std::fs::create_dir_all(&github_dir).unwrap();
        let config_path = github_dir.join("kiln.yaml");
        std::fs::write(&config_path, "scheduler:\n  commit_window: 5").unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_in_parent_dir() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kiln.yaml");
        std::fs::write(&config_path, "flakes:\n  window_days: 3").unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config(&nested), Some(config_path));
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kiln.toml");
        std::fs::write(
            &config_path,
            "[scheduler]\nscore_decay_24hr = 1.0\npools = [\"Skia\"]\ndefault_pool = \"Skia\"\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.scheduler.score_decay_24hr, 1.0);
        assert_eq!(config.scheduler.pools, vec!["Skia".to_string()]);
        assert_eq!(config.scheduler.commit_window, 10);
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kiln.yaml");
        std::fs::write(
            &config_path,
            "executor:\n  backend: memory\n  pending_lookback_hours: 24\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.executor.backend, "memory");
        assert_eq!(config.executor.pending_lookback_hours, 24);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("kiln.yaml");
        std::fs::write(&config_path, "scheduler:\n  score_decay_24hr: 1.5\n").unwrap();

        assert!(load_config(&config_path).is_err());
    }

    #[test]
    fn test_explicit_config_path() {
        let temp = TempDir::new().unwrap();
        let explicit = temp.path().join("custom.yaml");
        std::fs::write(&explicit, "flakes:\n  window_days: 3").unwrap();
        std::fs::write(temp.path().join("kiln.yaml"), "flakes:\n  window_days: 9").unwrap();

        let found = resolve_config_path(temp.path(), Some(explicit.clone())).unwrap();
        assert_eq!(found, explicit);
        assert!(resolve_config_path(temp.path(), Some(temp.path().join("missing.yaml"))).is_err());
        assert_eq!(
            resolve_config_path(temp.path(), None).unwrap(),
            temp.path().join("kiln.yaml")
        );
    }

    #[test]
    fn test_load_config_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path());
        assert!(path.is_none());
        assert_eq!(config.scheduler.trigger_timeout_secs, 60);
    }
}
