//! taskhost Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Worker processes or sockets
//! - HTTP
//! - Runtime specifics
//!
//! Everything the orchestrator stores or reports is defined here.

pub mod error;
pub mod ids;
pub mod log;
pub mod run;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{LogId, RunId, TaskId};
pub use log::{LogEntry, LogFilter};
pub use run::{Run, RunOutcome};
pub use status::RunStatus;
pub use task::{DiscoveredTask, Task};
