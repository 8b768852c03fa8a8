//! Worker-side protocol client.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

use taskhost_core::{DiscoveredTask, RunId};

use crate::codec::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use crate::messages::{
    Ack, CallbackRequest, GetInputResponse, GetSubtaskResultRequest, RegisterTasksRequest,
    Request, RequestFrame, ResponseFrame, RunSubtaskRequest, RunSubtaskResponse, SubtaskResult,
};
use crate::{ProtoError, WorkerMode, SOCKET_PATH_ENV};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client a worker process uses to talk to its invocation server.
///
/// Calls are serialized over a single connection; each waits for its response.
pub struct WorkerClient {
    conn: Mutex<Connection>,
    next_id: AtomicU64,
    max_frame_bytes: usize,
}

impl WorkerClient {
    /// Connect to the invocation server listening at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ProtoError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read, write) = stream.into_split();
        debug!(path = %path.as_ref().display(), "Connected to invocation server");
        Ok(Self {
            conn: Mutex::new(Connection {
                reader: BufReader::new(read),
                writer: write,
            }),
            next_id: AtomicU64::new(1),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    /// Connect using the socket path and mode injected by the orchestrator.
    pub async fn from_env() -> Result<(Self, WorkerMode), ProtoError> {
        let mode = WorkerMode::from_env()?;
        let path =
            std::env::var(SOCKET_PATH_ENV).map_err(|_| ProtoError::MissingEnv(SOCKET_PATH_ENV))?;
        Ok((Self::connect(path).await?, mode))
    }

    /// Set the largest response line accepted.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Send one request and decode its response.
    pub async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, ProtoError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = request.method();
        let frame = RequestFrame { id, request };

        let mut conn = self.conn.lock().await;
        write_frame(&mut conn.writer, &frame).await?;

        let response: ResponseFrame = read_frame(&mut conn.reader, self.max_frame_bytes)
            .await?
            .ok_or(ProtoError::ConnectionClosed)?;
        if response.id != id {
            return Err(ProtoError::Protocol(format!(
                "response id {} does not match request id {}",
                response.id, id
            )));
        }

        debug!(id, method, ok = response.error.is_none(), "Call finished");
        response.into_result()
    }

    /// Fetch the task name and input for this invocation.
    pub async fn get_input(&self) -> Result<GetInputResponse, ProtoError> {
        self.call(Request::GetInput).await
    }

    /// Report successful completion.
    pub async fn complete(&self, output: Value) -> Result<(), ProtoError> {
        self.post_callback(CallbackRequest::Complete { output }).await
    }

    /// Report failure.
    pub async fn fail(&self, details: impl Into<String>) -> Result<(), ProtoError> {
        self.post_callback(CallbackRequest::Error {
            details: details.into(),
        })
        .await
    }

    pub async fn post_callback(&self, callback: CallbackRequest) -> Result<(), ProtoError> {
        let _: Ack = self.call(Request::PostCallback(callback)).await?;
        Ok(())
    }

    /// Report the task catalogue (register mode).
    pub async fn register_tasks<I, S>(&self, names: I) -> Result<(), ProtoError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tasks = names.into_iter().map(DiscoveredTask::new).collect();
        let _: Ack = self
            .call(Request::PostRegisterTasks(RegisterTasksRequest { tasks }))
            .await?;
        Ok(())
    }

    /// Start a nested run; returns its id immediately.
    pub async fn run_subtask(
        &self,
        task_name: impl Into<String>,
        input: Value,
    ) -> Result<RunId, ProtoError> {
        let response: RunSubtaskResponse = self
            .call(Request::PostRunSubtask(RunSubtaskRequest {
                task_name: task_name.into(),
                input,
            }))
            .await?;
        Ok(response.run_id)
    }

    pub async fn get_subtask_result(&self, run_id: &RunId) -> Result<SubtaskResult, ProtoError> {
        self.call(Request::PostGetSubtaskResult(GetSubtaskResultRequest {
            run_id: run_id.clone(),
        }))
        .await
    }

    /// Poll a nested run every `interval` until it finishes.
    pub async fn wait_for_subtask(
        &self,
        run_id: &RunId,
        interval: Duration,
    ) -> Result<SubtaskResult, ProtoError> {
        loop {
            let result = self.get_subtask_result(run_id).await?;
            if result.is_finished() {
                return Ok(result);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
