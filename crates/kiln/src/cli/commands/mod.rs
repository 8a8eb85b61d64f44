//! CLI commands

mod completions;
mod flakes;
mod init;
mod plan;
mod run;
mod status;
mod validate;

pub use completions::CompletionsCommand;
pub use flakes::FlakesCommand;
pub use init::InitCommand;
pub use plan::PlanCommand;
pub use run::RunCommand;
pub use status::StatusCommand;
pub use validate::ValidateCommand;
