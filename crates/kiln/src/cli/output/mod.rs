//! Output formatting utilities

use console::{style, Style};
use kiln_core::{JobStatus, TaskStatus};

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for a job status
pub fn job_status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::InProgress => Style::new().blue(),
        JobStatus::Success => Style::new().green(),
        JobStatus::Failure => Style::new().red().bold(),
        JobStatus::Mishap => Style::new().magenta().bold(),
    }
}

/// Style for a task status
pub fn task_status_style(status: TaskStatus) -> Style {
    match status {
        TaskStatus::Pending => Style::new().dim(),
        TaskStatus::Running => Style::new().blue(),
        TaskStatus::Success => Style::new().green(),
        TaskStatus::Failure => Style::new().red(),
        TaskStatus::Mishap => Style::new().magenta(),
    }
}

/// Style for task keys
pub fn key_style() -> Style {
    Style::new().cyan()
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}
