//! Kiln - task scheduling and remote-execution coordination CLI

mod cli;

use std::path::PathBuf;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cli::{output, Cli};

/// Overrides the JSON log directory
const LOG_DIR_ENV: &str = "KILN_LOG_DIR";

fn main() {
    let cli = Cli::parse();
    let guard = init_tracing(&cli);

    if let Err(e) = cli.execute() {
        output::error(&format!("{:#}", e));
        drop(guard);
        std::process::exit(1);
    }
}

/// Console output on stderr filtered by RUST_LOG (warn by default, info with
/// --verbose, error with --quiet), plus debug-level JSON to a daily rolling
/// file when a log directory is available.
fn init_tracing(cli: &Cli) -> Option<WorkerGuard> {
    let default_level = match (cli.verbose, cli.quiet) {
        (true, _) => "info",
        (false, true) => "error",
        (false, false) => "warn",
    };
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        );

    let (file, guard) = match log_directory() {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "kiln.log"));
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}

/// `$KILN_LOG_DIR`, else `~/.kiln/logs`. Created if missing.
fn log_directory() -> Option<PathBuf> {
    let dir = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()?.join(".kiln").join("logs"),
    };
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}
