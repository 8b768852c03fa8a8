//! taskhost runtime
//!
//! Runs tasks implemented by an external worker program. Each run gets its own
//! worker process and a private Unix socket the worker uses to fetch its input,
//! start nested runs and report the result. Captured worker output, run state
//! and completion events are served over HTTP.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod invocation;
pub mod logs;
pub mod payload;
pub mod reporter;
pub mod socket;
pub mod state;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::CoordinatorError;
pub use logs::{LogInterceptor, LogStore, LogSubscription, Passthrough};
pub use reporter::StatusReporter;
pub use state::AppState;
pub use store::{RunSubscription, TaskRunStore};
pub use supervisor::{LaunchSpec, ProcessSupervisor, WorkerExit, WorkerHandle, WorkerLauncher};
