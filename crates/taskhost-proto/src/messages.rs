//! Protocol message definitions.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskhost_core::{DiscoveredTask, RunId};

use crate::ProtoError;

/// A worker request, tagged by operation name.
///
/// ```json
/// {"method": "PostCallback", "params": {"complete": {"output": [42]}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    /// Fetch the task name and input for a `run` invocation.
    GetInput,
    /// Report the final result of a `run` invocation.
    PostCallback(CallbackRequest),
    /// Report the task catalogue during a `register` invocation.
    PostRegisterTasks(RegisterTasksRequest),
    /// Start a nested run with the current run as parent.
    PostRunSubtask(RunSubtaskRequest),
    /// Poll a nested run.
    PostGetSubtaskResult(GetSubtaskResultRequest),
}

impl Request {
    /// Operation name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetInput => "GetInput",
            Self::PostCallback(_) => "PostCallback",
            Self::PostRegisterTasks(_) => "PostRegisterTasks",
            Self::PostRunSubtask(_) => "PostRunSubtask",
            Self::PostGetSubtaskResult(_) => "PostGetSubtaskResult",
        }
    }
}

/// Final result of a run. Exactly one branch by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallbackRequest {
    Complete { output: Value },
    Error { details: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterTasksRequest {
    pub tasks: Vec<DiscoveredTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSubtaskRequest {
    pub task_name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSubtaskResponse {
    pub run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSubtaskResultRequest {
    pub run_id: RunId,
}

/// Status of a nested run as seen by its parent's worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubtaskResult {
    StillRunning {},
    Complete { output: Value },
    Error { details: String },
}

impl SubtaskResult {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::StillRunning {})
    }
}

/// Answer to `GetInput`. Both fields are empty for `register` invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetInputResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Empty acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ack {}

/// One request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: Request,
}

/// One response line. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn ok<T: Serialize>(id: u64, result: &T) -> Result<Self, ProtoError> {
        Ok(Self {
            id,
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Decode the result, or surface the orchestrator's error.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ProtoError> {
        if let Some(message) = self.error {
            return Err(ProtoError::Remote(message));
        }
        let value = self.result.unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}
