//! Per-invocation RPC server.
//!
//! One [`InvocationServer`] serves one worker invocation over its own socket.
//! It answers the worker's protocol calls and resolves a single
//! [`InvocationOutcome`] when the worker reports its result or catalogue.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskhost_core::{CoreError, DiscoveredTask, RunId, RunOutcome};
use taskhost_proto::{
    read_frame, write_frame, Ack, CallbackRequest, GetInputResponse, ProtoError, Request,
    RequestFrame, ResponseFrame, RunSubtaskResponse, SubtaskResult,
};

use crate::error::CoordinatorError;
use crate::payload;
use crate::socket::Socket;

/// Lifecycle of one invocation.
///
/// Run mode: `Starting -> AwaitingCallback -> Completed | Failed`.
/// Register mode: `Starting -> AwaitingRegistration -> Discovered | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Starting,
    AwaitingCallback,
    AwaitingRegistration,
    Completed,
    Failed,
    Discovered,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Discovered)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Starting, AwaitingCallback | AwaitingRegistration | Failed)
                | (AwaitingCallback, Completed | Failed)
                | (AwaitingRegistration, Discovered | Failed)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: Self) -> Result<(), CoreError> {
        if !self.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::AwaitingCallback => "awaiting_callback",
            Self::AwaitingRegistration => "awaiting_registration",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Discovered => "discovered",
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the worker was launched to do.
#[derive(Debug, Clone)]
pub enum InvocationMode {
    Run {
        run_id: RunId,
        task_name: String,
        input: Vec<u8>,
    },
    Register,
}

impl InvocationMode {
    fn awaiting_state(&self) -> InvocationState {
        match self {
            Self::Run { .. } => InvocationState::AwaitingCallback,
            Self::Register => InvocationState::AwaitingRegistration,
        }
    }

    fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Run { run_id, .. } => Some(run_id),
            Self::Register => None,
        }
    }
}

/// The single result an invocation resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Finished(RunOutcome),
    Registered(Vec<DiscoveredTask>),
}

/// Nested-run operations a worker may call during a run.
#[async_trait]
pub trait SubtaskHost: Send + Sync {
    /// Start `task_name` as a child of `parent`.
    async fn start_subtask(
        &self,
        parent: &RunId,
        task_name: &str,
        input: Value,
    ) -> Result<RunId, CoordinatorError>;

    async fn subtask_result(&self, run_id: &RunId) -> Result<SubtaskResult, CoordinatorError>;
}

struct Lifecycle {
    state: InvocationState,
    outcome_tx: Option<oneshot::Sender<InvocationOutcome>>,
}

struct Inner {
    mode: InvocationMode,
    lifecycle: Mutex<Lifecycle>,
    host: Option<Arc<dyn SubtaskHost>>,
    max_frame_bytes: usize,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_transition(&self, from: InvocationState, to: InvocationState) {
        info!(
            run_id = ?self.mode.run_id().map(RunId::as_str),
            from = %from,
            to = %to,
            "Invocation state changed"
        );
    }

    /// Resolve the invocation. Fails if it is no longer waiting for a result.
    fn resolve(&self, next: InvocationState, outcome: InvocationOutcome) -> Result<(), String> {
        let mut lifecycle = self.lifecycle();
        let from = lifecycle.state;
        // Workers may report before the server finished starting.
        if from == InvocationState::Starting {
            lifecycle.state = self.mode.awaiting_state();
        }
        if let Err(e) = lifecycle.state.transition(next) {
            lifecycle.state = from;
            return Err(format!("invocation already {from}: {e}"));
        }
        if let Some(tx) = lifecycle.outcome_tx.take() {
            let _ = tx.send(outcome);
        }
        drop(lifecycle);

        self.log_transition(from, next);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), String> {
        let state = self.lifecycle().state;
        if state.is_terminal() {
            return Err(format!("invocation already {state}"));
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<Value, String> {
        match request {
            Request::GetInput => {
                let response = match &self.mode {
                    InvocationMode::Run {
                        task_name, input, ..
                    } => GetInputResponse {
                        task_name: Some(task_name.clone()),
                        input: Some(payload::decode(input)),
                    },
                    InvocationMode::Register => GetInputResponse::default(),
                };
                to_value(&response)
            }

            Request::PostCallback(callback) => {
                if !matches!(self.mode, InvocationMode::Run { .. }) {
                    return Err("PostCallback is only valid for run invocations".into());
                }
                let (next, outcome) = match callback {
                    CallbackRequest::Complete { output } => (
                        InvocationState::Completed,
                        RunOutcome::Complete(payload::encode(&output)),
                    ),
                    CallbackRequest::Error { details } => {
                        (InvocationState::Failed, RunOutcome::Failed(details))
                    }
                };
                self.resolve(next, InvocationOutcome::Finished(outcome))?;
                to_value(&Ack {})
            }

            Request::PostRegisterTasks(registration) => {
                if !matches!(self.mode, InvocationMode::Register) {
                    return Err("PostRegisterTasks is only valid for register invocations".into());
                }
                debug!(count = registration.tasks.len(), "Worker registered tasks");
                self.resolve(
                    InvocationState::Discovered,
                    InvocationOutcome::Registered(registration.tasks),
                )?;
                to_value(&Ack {})
            }

            Request::PostRunSubtask(subtask) => {
                let parent = self.run_parent()?;
                self.ensure_open()?;
                let host = self.host()?;
                let run_id = host
                    .start_subtask(parent, &subtask.task_name, subtask.input)
                    .await
                    .map_err(|e| e.to_string())?;
                to_value(&RunSubtaskResponse { run_id })
            }

            Request::PostGetSubtaskResult(query) => {
                self.run_parent()?;
                let host = self.host()?;
                let result = host
                    .subtask_result(&query.run_id)
                    .await
                    .map_err(|e| e.to_string())?;
                to_value(&result)
            }
        }
    }

    fn run_parent(&self) -> Result<&RunId, String> {
        self.mode
            .run_id()
            .ok_or_else(|| "subtasks are only available to run invocations".to_string())
    }

    fn host(&self) -> Result<&Arc<dyn SubtaskHost>, String> {
        self.host
            .as_ref()
            .ok_or_else(|| "subtasks are not supported by this invocation".to_string())
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Serves the protocol for one worker invocation until shut down.
///
/// Dropping the server stops it and removes its socket.
pub struct InvocationServer {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl InvocationServer {
    /// Start serving on `socket`.
    ///
    /// The returned receiver yields the outcome once; it errors if the
    /// invocation is abandoned or the server stops first.
    pub fn start(
        socket: Socket,
        mode: InvocationMode,
        host: Option<Arc<dyn SubtaskHost>>,
        max_frame_bytes: usize,
        cancel: &CancellationToken,
    ) -> (Self, oneshot::Receiver<InvocationOutcome>) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            mode,
            lifecycle: Mutex::new(Lifecycle {
                state: InvocationState::Starting,
                outcome_tx: Some(outcome_tx),
            }),
            host,
            max_frame_bytes,
        });
        let shutdown = cancel.child_token();

        tokio::spawn(accept_loop(socket, inner.clone(), shutdown.clone()));

        {
            let mut lifecycle = inner.lifecycle();
            let next = inner.mode.awaiting_state();
            if lifecycle.state == InvocationState::Starting {
                lifecycle.state = next;
                drop(lifecycle);
                inner.log_transition(InvocationState::Starting, next);
            }
        }

        (Self { inner, shutdown }, outcome_rx)
    }

    pub fn state(&self) -> InvocationState {
        self.inner.lifecycle().state
    }

    /// Fail the invocation without a worker result.
    ///
    /// Returns false if the invocation had already resolved, in which case the
    /// outcome is still waiting on the receiver.
    pub fn abandon(&self, reason: &str) -> bool {
        let mut lifecycle = self.inner.lifecycle();
        let from = lifecycle.state;
        if lifecycle.state.transition(InvocationState::Failed).is_err() {
            return false;
        }
        lifecycle.outcome_tx = None;
        drop(lifecycle);

        warn!(
            run_id = ?self.inner.mode.run_id().map(RunId::as_str),
            reason,
            "Invocation abandoned"
        );
        self.inner.log_transition(from, InvocationState::Failed);
        true
    }

    /// Stop accepting connections and close open ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for InvocationServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(socket: Socket, inner: Arc<Inner>, shutdown: CancellationToken) {
    debug!(path = %socket.path().display(), "Invocation server listening");
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = socket.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(path = %socket.path().display(), error = %e, "Accept failed");
                    break;
                }
            },
        };
        tokio::spawn(serve_connection(stream, inner.clone(), shutdown.clone()));
    }
    debug!(path = %socket.path().display(), "Invocation server stopped");
}

async fn serve_connection(stream: UnixStream, inner: Arc<Inner>, shutdown: CancellationToken) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame::<_, Value>(&mut reader, inner.max_frame_bytes) => frame,
        };

        let raw = match frame {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(ProtoError::Json(e)) => {
                warn!(error = %e, "Malformed request line");
                let response = ResponseFrame::err(0, format!("malformed request: {e}"));
                if write_frame(&mut write, &response).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Worker connection failed");
                break;
            }
        };

        let id = raw.get("id").and_then(Value::as_u64).unwrap_or(0);
        let response = match serde_json::from_value::<RequestFrame>(raw) {
            Ok(frame) => {
                let method = frame.request.method();
                debug!(id, method, "Worker request");
                match inner.dispatch(frame.request).await {
                    Ok(result) => ResponseFrame {
                        id,
                        result: Some(result),
                        error: None,
                    },
                    Err(message) => {
                        warn!(id, method, error = %message, "Worker request rejected");
                        ResponseFrame::err(id, message)
                    }
                }
            }
            Err(e) => ResponseFrame::err(id, format!("invalid request: {e}")),
        };

        if let Err(e) = write_frame(&mut write, &response).await {
            debug!(error = %e, "Failed to answer worker");
            break;
        }
    }
}
