//! Error types for the worker protocol.

use thiserror::Error;

/// Errors that can occur while speaking the worker protocol.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line exceeded the frame size limit.
    #[error("Frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    /// Peer sent something that does not fit the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The orchestrator rejected the request.
    #[error("Orchestrator error: {0}")]
    Remote(String),

    /// Peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Required environment variable is not set.
    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// Mode flag is neither `run` nor `register`.
    #[error("Invalid worker mode: {0}")]
    InvalidMode(String),
}
