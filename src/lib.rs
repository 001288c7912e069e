pub mod config;
pub mod constants;
pub mod environment;
pub mod error;
pub mod logging;
pub mod poll;
pub mod registry;
pub mod resources;
pub mod runner;
pub mod stats;

#[cfg(feature = "server")]
pub mod server;

pub use environment::{BackendConfig, Environment, EnvironmentFactory, ExecOptions, ExecOutput};
pub use error::{Result, RolloutError};
pub use resources::{ResourceLedger, ResourceVector};
pub use runner::{ClosePolicy, Runner, RunnerOptions};
