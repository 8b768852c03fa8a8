//! Worker process environment contract.

use std::fmt;
use std::str::FromStr;

use crate::ProtoError;

/// Absolute path of the Unix socket the worker must connect to.
pub const SOCKET_PATH_ENV: &str = "TASKHOST_SOCKET_PATH";

/// What the worker was launched for: `run` or `register`.
pub const MODE_ENV: &str = "TASKHOST_MODE";

/// Why a worker process was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerMode {
    /// Execute one task run.
    Run,
    /// Report the task catalogue and exit.
    Register,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Register => "register",
        }
    }

    /// Read the mode from [`MODE_ENV`].
    pub fn from_env() -> Result<Self, ProtoError> {
        let raw = std::env::var(MODE_ENV).map_err(|_| ProtoError::MissingEnv(MODE_ENV))?;
        raw.parse()
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerMode {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "register" => Ok(Self::Register),
            other => Err(ProtoError::InvalidMode(other.to_string())),
        }
    }
}
