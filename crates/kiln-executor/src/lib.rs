//! Remote execution backends for Kiln
//!
//! This crate defines the [`TaskExecutor`] contract the scheduler dispatches
//! through, and the backends that implement it.
//!
//! ## Backends
//!
//! - **Swarming**: REST API of a Swarming-style execution fleet
//! - **Memory**: in-process fleet used for local runs and tests
//!
//! ## Usage
//!
//! ```ignore
//! use kiln_executor::{SwarmingExecutor, TaskExecutor, TimeoutExecutor};
//!
//! let backend = SwarmingExecutor::from_executor_config(&config.executor)?;
//! let executor = TimeoutExecutor::new(backend, Duration::from_secs(60));
//! let task = executor.trigger_task(&request).await?;
//! ```

pub mod error;
pub mod memory;
pub mod swarming;
pub mod timeout;
pub mod traits;
pub mod types;
pub mod validation;

pub use error::{ExecutorError, Result};
pub use memory::{AutoRun, InMemoryExecutor};
pub use swarming::{convert_task_status, SwarmingConfig, SwarmingExecutor};
pub use timeout::TimeoutExecutor;
pub use traits::TaskExecutor;
pub use types::*;
pub use validation::validate_request;
