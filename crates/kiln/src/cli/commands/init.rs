//! Init command

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use console::style;
use tracing::info;

use kiln_core::config::defaults::{
    default_config_toml, DEFAULT_CONFIG_TEMPLATE, DEFAULT_CONFIG_TOML, DEFAULT_CONFIG_YAML,
};

use crate::cli::{output, Cli};

/// Configuration file format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    #[default]
    Yaml,
    Toml,
}

/// Write a default configuration file
#[derive(Debug, Args)]
pub struct InitCommand {
    /// Force overwrite existing configuration
    #[arg(short, long)]
    pub force: bool,

    /// Configuration format
    #[arg(long = "config-format", value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Output file path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl InitCommand {
    /// Execute the init command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(force = self.force, format = ?self.config_format, "executing init command");
        let cwd = std::env::current_dir()?;
        let default_name = match self.config_format {
            ConfigFormat::Yaml => DEFAULT_CONFIG_YAML,
            ConfigFormat::Toml => DEFAULT_CONFIG_TOML,
        };
        let config_path = self
            .output
            .clone()
            .unwrap_or_else(|| cwd.join(default_name));

        if config_path.exists() && !self.force {
            anyhow::bail!(
                "Configuration file already exists at {}. Use --force to overwrite.",
                config_path.display()
            );
        }

        let content = match self.config_format {
            ConfigFormat::Yaml => DEFAULT_CONFIG_TEMPLATE.to_string(),
            ConfigFormat::Toml => format!("# Kiln Configuration\n\n{}", default_config_toml()?),
        };

        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, &content)?;

        if !cli.quiet {
            output::success(&format!(
                "Created configuration at {}",
                output::path_style().apply_to(config_path.display())
            ));
            println!();
            println!("Next steps:");
            println!("  1. Point {} at your execution backend", config_path.display());
            println!("  2. Run {} to verify your setup", style("kiln validate").cyan());
            println!(
                "  3. Run {} to start scheduling",
                style("kiln run --workload workload.yaml").cyan()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use kiln_core::config::load_config;
    use tempfile::TempDir;

    fn quiet() -> Cli {
        Cli::parse_from(["kiln", "-q", "validate"])
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let temp = TempDir::new().unwrap();
        for (format, name) in [(ConfigFormat::Yaml, "kiln.yaml"), (ConfigFormat::Toml, "kiln.toml")] {
            let path = temp.path().join(name);
            let cmd = InitCommand {
                force: false,
                config_format: format,
                output: Some(path.clone()),
            };
            cmd.execute(&quiet()).unwrap();

            let config = load_config(&path).unwrap();
            assert_eq!(config.scheduler.commit_window, 10);
        }
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kiln.yaml");
        std::fs::write(&path, "scheduler: {}\n").unwrap();

        let cmd = InitCommand {
            force: false,
            config_format: ConfigFormat::Yaml,
            output: Some(path.clone()),
        };
        assert!(cmd.execute(&quiet()).is_err());

        let forced = InitCommand { force: true, ..cmd };
        forced.execute(&quiet()).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Kiln Configuration"));
    }
}
