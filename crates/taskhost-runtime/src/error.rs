//! Orchestration errors.

use std::io;

use thiserror::Error;

use taskhost_core::CoreError;

/// Errors from starting runs and discovering tasks.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Failed to allocate socket: {0}")]
    Socket(#[source] io::Error),

    #[error("Failed to start worker: {0}")]
    Spawn(#[source] io::Error),

    /// The discovery pass ended without a task catalogue.
    #[error("Task discovery failed: {0}")]
    Discovery(String),

    #[error("Orchestrator is shutting down")]
    Cancelled,
}

impl CoordinatorError {
    /// Returns true for lookups that found nothing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::TaskNotFound(_) => true,
            Self::Core(e) => e.is_not_found(),
            _ => false,
        }
    }
}
