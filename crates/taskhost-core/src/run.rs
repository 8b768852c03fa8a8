//! Run records and their terminal outcomes.

use crate::{CoreError, RunId, RunStatus};
use chrono::{DateTime, Utc};

/// How a run ended. Exactly one branch is ever set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Output bytes reported by the worker.
    Complete(Vec<u8>),
    /// Error message.
    Failed(String),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Complete(_) => RunStatus::Complete,
            Self::Failed(_) => RunStatus::Failed,
        }
    }
}

/// One invocation of a task with a specific input.
///
/// Created `Running`, finished exactly once, immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,

    /// Name of the task this run executes.
    pub task_name: String,

    /// Input payload (JSON-encoded bytes).
    pub input: Vec<u8>,

    /// Output payload (JSON-encoded bytes), empty until complete.
    pub output: Vec<u8>,

    /// Current run status.
    pub status: RunStatus,

    /// Error message if the run failed.
    pub error: Option<String>,

    /// When the run was created.
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,

    /// Run that requested this one as a subtask.
    pub parent_run_id: Option<RunId>,
}

impl Run {
    /// Create a new running Run.
    pub fn new(task_name: impl Into<String>, input: Vec<u8>, parent_run_id: Option<RunId>) -> Self {
        Self {
            id: RunId::generate(),
            task_name: task_name.into(),
            input,
            output: Vec::new(),
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            parent_run_id,
        }
    }

    /// Apply the terminal outcome.
    ///
    /// Fails if the run already finished; status never moves backwards.
    pub fn finish(&mut self, outcome: RunOutcome) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: outcome.status().to_string(),
            });
        }

        self.status = outcome.status();
        self.completed_at = Some(Utc::now());
        match outcome {
            RunOutcome::Complete(output) => self.output = output,
            RunOutcome::Failed(message) => self.error = Some(message),
        }
        Ok(())
    }

    /// Wall-clock duration, if finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_running() {
        let run = Run::new("double", b"[21]".to_vec(), None);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());
        assert!(run.error.is_none());
    }

    #[test]
    fn test_complete_sets_output_and_time() {
        let mut run = Run::new("double", b"[21]".to_vec(), None);
        run.finish(RunOutcome::Complete(b"[42]".to_vec())).unwrap();

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.output, b"[42]");
        assert!(run.completed_at.is_some());
        assert!(run.duration().is_some());
    }

    #[test]
    fn test_terminal_status_never_reverts() {
        let mut run = Run::new("flaky", Vec::new(), None);
        run.finish(RunOutcome::Failed("boom".into())).unwrap();

        let err = run
            .finish(RunOutcome::Complete(b"[]".to_vec()))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }
}
