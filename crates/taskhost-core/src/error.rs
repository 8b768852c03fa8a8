//! Core domain errors.

use thiserror::Error;

/// Core domain errors for taskhost.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No task matches the identifier, either by id or by `workflow/taskName` suffix.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Returns true for lookups that found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound(_) | Self::RunNotFound(_))
    }
}
