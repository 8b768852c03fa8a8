//! HTTP request and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use taskhost_core::{LogEntry, Run, RunStatus, Task};

use crate::error::CoordinatorError;
use crate::payload;

// ============================================================================
// Task types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            name: task.name.clone(),
            created_at: task.created_at,
        }
    }
}

// ============================================================================
// Run types
// ============================================================================

/// Request body for submitting a run.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRunRequest {
    /// Task id or `workflow/taskName` identifier.
    pub task: String,

    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummaryResponse {
    pub id: String,
    pub task_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_run_id: Option<String>,
}

impl From<&Run> for RunSummaryResponse {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.to_string(),
            task_name: run.task_name.clone(),
            status: run.status,
            started_at: run.started_at,
            completed_at: run.completed_at,
            parent_run_id: run.parent_run_id.as_ref().map(ToString::to_string),
        }
    }
}

/// A run with its payloads. `results` is `null` until the run completes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub summary: RunSummaryResponse,
    pub input: Value,
    pub results: Value,
    pub error: Option<String>,
}

impl From<&Run> for RunDetailResponse {
    fn from(run: &Run) -> Self {
        Self {
            summary: RunSummaryResponse::from(run),
            input: payload::decode(&run.input),
            results: payload::decode(&run.output),
            error: run.error.clone(),
        }
    }
}

// ============================================================================
// Log types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogResponse {
    pub id: String,
    pub task_run_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&LogEntry> for LogResponse {
    fn from(entry: &LogEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            task_run_id: entry.run_id.as_ref().map(ToString::to_string),
            message: entry.message.clone(),
            timestamp: entry.timestamp,
        }
    }
}

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// Handler errors with their HTTP status.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => {
                error!(error = %message, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        if err.is_not_found() {
            ApiError::NotFound(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskhost_core::{RunId, RunOutcome};

    #[test]
    fn test_run_detail_shape() {
        let parent = RunId::new("parent-1");
        let mut run = Run::new("double", b"[21]".to_vec(), Some(parent));
        run.finish(RunOutcome::Complete(b"[42]".to_vec())).unwrap();

        let value = serde_json::to_value(RunDetailResponse::from(&run)).unwrap();
        assert_eq!(value["taskName"], "double");
        assert_eq!(value["status"], "complete");
        assert_eq!(value["parentRunId"], "parent-1");
        assert_eq!(value["input"], json!([21]));
        assert_eq!(value["results"], json!([42]));
        assert_eq!(value["error"], Value::Null);
        assert!(value["completedAt"].is_string());
    }

    #[test]
    fn test_error_status_mapping() {
        let not_found: ApiError = CoordinatorError::TaskNotFound("x".into()).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let spawn: ApiError =
            CoordinatorError::Spawn(std::io::Error::new(std::io::ErrorKind::NotFound, "x")).into();
        assert_eq!(
            spawn.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
