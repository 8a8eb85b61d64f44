//! Validate command

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::Args;
use console::style;
use tracing::info;

use kiln_core::config::{load_config_from_dir, validation::validate_config, Config};
use kiln_core::CommitSpecs;
use kiln_scheduler::Workload;

use crate::cli::{Cli, OutputFormat};

/// Validate configuration and workload
#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Workload file to check alongside the configuration
    #[arg(short, long)]
    pub workload: Option<PathBuf>,

    /// Strict mode - treat warnings as errors
    #[arg(long)]
    pub strict: bool,
}

impl ValidateCommand {
    /// Execute the validate command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(
            workload = ?self.workload,
            strict = self.strict,
            "executing validate command"
        );
        let cwd = std::env::current_dir()?;

        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        // Validate configuration
        let (config, config_path) = match load_config_from_dir(&cwd) {
            Ok((c, p)) => (Some(c), Some(p)),
            Err(e) => {
                errors.push(format!("Configuration: {}", e));
                (None, None)
            }
        };

        if let Some(ref cfg) = config {
            if let Err(e) = validate_config(cfg) {
                errors.push(format!("Configuration validation: {}", e));
            }
        }

        if let Some(ref path) = self.workload {
            match Workload::load(path) {
                Ok(workload) => {
                    check_workload(&workload, config.as_ref(), &mut errors, &mut warnings)
                }
                Err(e) => errors.push(format!("Workload: {}", e)),
            }
        }

        // If strict, promote warnings to errors
        if self.strict {
            errors.append(&mut warnings);
        }

        let passed = errors.is_empty();

        match cli.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "valid": passed,
                    "config_path": config_path.map(|p| p.to_string_lossy().to_string()),
                    "workload_path": self.workload.as_ref().map(|p| p.to_string_lossy().to_string()),
                    "errors": errors,
                    "warnings": warnings
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Text => {
                if !cli.quiet {
                    println!("{}", style("Validation Results").bold());
                    println!();

                    if let Some(path) = config_path {
                        println!("Config:   {}", style(path.display()).cyan());
                    }
                    if let Some(ref path) = self.workload {
                        println!("Workload: {}", style(path.display()).cyan());
                    }
                    println!();

                    if !errors.is_empty() {
                        println!("{}", style("Errors:").red().bold());
                        for error in &errors {
                            println!("  {} {}", style("✗").red(), error);
                        }
                        println!();
                    }

                    if !warnings.is_empty() {
                        println!("{}", style("Warnings:").yellow().bold());
                        for warning in &warnings {
                            println!("  {} {}", style("!").yellow(), warning);
                        }
                        println!();
                    }

                    if passed {
                        if warnings.is_empty() {
                            println!("{}", style("✓ All checks passed").green().bold());
                        } else {
                            println!(
                                "{} with {} warning(s)",
                                style("✓ Validation passed").green().bold(),
                                warnings.len()
                            );
                        }
                    } else {
                        println!(
                            "{} with {} error(s)",
                            style("✗ Validation failed").red().bold(),
                            errors.len()
                        );
                    }
                }
            }
        }

        if !passed {
            std::process::exit(1);
        }

        Ok(())
    }
}

fn check_workload(
    workload: &Workload,
    config: Option<&Config>,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if workload.commits.is_empty() {
        warnings.push("Workload has no commits".to_string());
    }

    check_specs("specs", &workload.specs, errors, warnings);
    for (revision, specs) in &workload.overrides {
        if !workload.commits.iter().any(|c| &c.revision == revision) {
            warnings.push(format!("Override for unknown revision '{}'", revision));
        }
        check_specs(&format!("overrides.{}", revision), specs, errors, warnings);
    }

    match workload.fleet() {
        Ok(machines) => {
            let memory = config.is_some_and(|c| c.executor.backend == "memory");
            if memory && machines.is_empty() {
                warnings.push("In-memory backend has no machines".to_string());
            }
        }
        Err(e) => errors.push(format!("Machines: {}", e)),
    }
}

fn check_specs(
    scope: &str,
    specs: &CommitSpecs,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let mut reachable = BTreeSet::new();
    let mut job_names: Vec<&String> = specs.jobs.keys().collect();
    job_names.sort();

    for name in job_names {
        let job = &specs.jobs[name];
        if job.tasks.is_empty() {
            warnings.push(format!("{}: job '{}' has no tasks", scope, name));
        }
        match specs.dependency_closure(name, job) {
            Ok(graph) => reachable.extend(graph.into_keys()),
            Err(e) => errors.push(format!("{}: {}", scope, e)),
        }
    }

    let mut task_names: Vec<&String> = specs.tasks.keys().collect();
    task_names.sort();
    for name in task_names {
        let spec = &specs.tasks[name];
        if let Err(e) = spec.parsed_dimensions() {
            errors.push(format!("{}: task '{}': {}", scope, name, e));
        }
        if spec.command.is_empty() {
            errors.push(format!("{}: task '{}' has no command", scope, name));
        }
        if spec.max_attempts == 0 {
            errors.push(format!("{}: task '{}' has max_attempts 0", scope, name));
        }
        if !reachable.contains(name) {
            warnings.push(format!("{}: task '{}' is not used by any job", scope, name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{JobSpec, TaskSpec};

    fn task(command: &[&str], deps: &[&str]) -> TaskSpec {
        TaskSpec {
            command: command.iter().map(|s| s.to_string()).collect(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn job(tasks: &[&str]) -> JobSpec {
        JobSpec {
            tasks: tasks.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_specs() {
        let mut specs = CommitSpecs::default();
        specs.tasks.insert("build".to_string(), task(&["make"], &[]));
        specs.tasks.insert("test".to_string(), task(&["make", "test"], &["build"]));
        specs.jobs.insert("ci".to_string(), job(&["test"]));

        let (mut errors, mut warnings) = (Vec::new(), Vec::new());
        check_specs("specs", &specs, &mut errors, &mut warnings);
        assert!(errors.is_empty(), "{:?}", errors);
        assert!(warnings.is_empty(), "{:?}", warnings);
    }

    #[test]
    fn test_spec_problems() {
        let mut specs = CommitSpecs::default();
        specs.tasks.insert("a".to_string(), task(&["run"], &["b"]));
        specs.tasks.insert("b".to_string(), task(&["run"], &["a"]));
        specs.tasks.insert("lonely".to_string(), task(&[], &[]));
        let mut bad_dims = task(&["run"], &[]);
        bad_dims.dimensions = vec!["no-colon".to_string()];
        specs.tasks.insert("dims".to_string(), bad_dims);
        specs.jobs.insert("cycle".to_string(), job(&["a"]));
        specs.jobs.insert("missing".to_string(), job(&["ghost"]));
        specs.jobs.insert("dims".to_string(), job(&["dims"]));

        let (mut errors, mut warnings) = (Vec::new(), Vec::new());
        check_specs("specs", &specs, &mut errors, &mut warnings);

        // cycle, unknown spec, bad dimension, empty command
        assert_eq!(errors.len(), 4, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("'lonely' has no command")));
        assert!(warnings.iter().any(|w| w.contains("'lonely' is not used")));
    }

    #[test]
    fn test_workload_machines() {
        let mut workload = Workload::default();
        workload
            .machines
            .insert("bot-1".to_string(), vec!["pool:ci".to_string()]);
        let mut config = Config::default();
        config.executor.backend = "memory".to_string();

        let (mut errors, mut warnings) = (Vec::new(), Vec::new());
        check_workload(&workload, Some(&config), &mut errors, &mut warnings);
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(warnings, vec!["Workload has no commits".to_string()]);

        workload
            .machines
            .insert("bot-2".to_string(), vec!["broken".to_string()]);
        let (mut errors, mut warnings) = (Vec::new(), Vec::new());
        check_workload(&workload, Some(&config), &mut errors, &mut warnings);
        assert_eq!(errors.len(), 1);
    }
}
