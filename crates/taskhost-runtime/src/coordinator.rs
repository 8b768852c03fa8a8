//! Run orchestration.
//!
//! The [`Coordinator`] resolves tasks, starts one worker invocation per run
//! and records how each run ends. Completion is asynchronous: callers get the
//! `Running` run back immediately and observe the result through the store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use taskhost_core::{CoreError, Run, RunId, RunOutcome, RunStatus, Task};
use taskhost_proto::{SubtaskResult, WorkerMode};

use crate::config::Config;
use crate::error::CoordinatorError;
use crate::invocation::{InvocationMode, InvocationOutcome, InvocationServer, SubtaskHost};
use crate::logs::LogStore;
use crate::payload;
use crate::reporter::{RunEvent, StatusReporter};
use crate::socket::SocketAllocator;
use crate::store::TaskRunStore;
use crate::supervisor::{LaunchSpec, WorkerExit, WorkerHandle, WorkerLauncher};

/// Failure message for runs still in flight at shutdown.
pub const SHUTDOWN_MESSAGE: &str = "orchestrator shut down before the run finished";

/// How long shutdown waits for supervision tasks to record their runs.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How a wait on an invocation ended.
enum Settled {
    Outcome(InvocationOutcome),
    Exited(WorkerExit),
    TimedOut(Duration),
    Cancelled,
    Closed,
}

/// Drives worker invocations for runs and discovery passes.
pub struct Coordinator {
    this: Weak<Coordinator>,
    config: Arc<Config>,
    store: Arc<TaskRunStore>,
    logs: Arc<LogStore>,
    sockets: Arc<SocketAllocator>,
    launcher: Arc<dyn WorkerLauncher>,
    reporter: Option<Arc<StatusReporter>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Coordinator {
    /// Create a coordinator whose workers and sockets live until `cancel` fires.
    pub fn new(
        config: Arc<Config>,
        store: Arc<TaskRunStore>,
        logs: Arc<LogStore>,
        launcher: Arc<dyn WorkerLauncher>,
        reporter: Option<Arc<StatusReporter>>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, CoordinatorError> {
        let sockets = SocketAllocator::new(cancel.clone()).map_err(CoordinatorError::Socket)?;
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            store,
            logs,
            sockets,
            launcher,
            reporter,
            cancel,
            tracker: TaskTracker::new(),
        }))
    }

    pub fn store(&self) -> &Arc<TaskRunStore> {
        &self.store
    }

    pub fn logs(&self) -> &Arc<LogStore> {
        &self.logs
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Run a discovery pass and replace the catalogue with its result.
    ///
    /// Returns `Cancelled` if `cancel` or the orchestrator lifetime ends first.
    pub async fn populate_tasks(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Task>, CoordinatorError> {
        if self.cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled);
        }

        let socket = self.sockets.new_socket().map_err(CoordinatorError::Socket)?;
        let spec = LaunchSpec {
            socket_path: socket.path().to_path_buf(),
            mode: WorkerMode::Register,
            run_id: None,
        };
        let (server, mut outcome_rx) = InvocationServer::start(
            socket,
            InvocationMode::Register,
            None,
            self.config.max_frame_bytes,
            &self.cancel,
        );

        let worker = self
            .launcher
            .launch(spec)
            .await
            .map_err(CoordinatorError::Spawn)?;

        let settled = self.settle(&mut outcome_rx, &worker, None, cancel).await;
        worker.terminate();
        server.shutdown();

        let discovered = match settled {
            Settled::Outcome(InvocationOutcome::Registered(tasks)) => tasks,
            Settled::Outcome(InvocationOutcome::Finished(_)) => {
                return Err(CoordinatorError::Discovery(
                    "worker reported a run result instead of tasks".into(),
                ));
            }
            Settled::Exited(exit) => {
                server.abandon("worker exited during discovery");
                return Err(CoordinatorError::Discovery(format!(
                    "worker exited ({exit}) without registering tasks"
                )));
            }
            Settled::TimedOut(_) | Settled::Closed => {
                return Err(CoordinatorError::Discovery(
                    "discovery ended without a task catalogue".into(),
                ));
            }
            Settled::Cancelled => {
                server.abandon("discovery cancelled");
                return Err(CoordinatorError::Cancelled);
            }
        };

        Ok(self.store.set_tasks(&discovered).await)
    }

    /// Start a run of the task matching `identifier`.
    ///
    /// Refreshes the catalogue first. The returned run is `Running`; the
    /// terminal state is recorded in the store when the worker finishes.
    pub async fn start_task(
        &self,
        identifier: &str,
        input: Vec<u8>,
        parent_run_id: Option<RunId>,
    ) -> Result<Run, CoordinatorError> {
        let this = self.this.upgrade().ok_or(CoordinatorError::Cancelled)?;

        self.populate_tasks(&self.cancel).await?;
        let task = self
            .store
            .get_task(identifier)
            .await
            .ok_or_else(|| CoordinatorError::TaskNotFound(identifier.to_string()))?;

        let socket = self.sockets.new_socket().map_err(CoordinatorError::Socket)?;
        let run = self
            .store
            .start_task_run(&task.name, input, parent_run_id)
            .await?;
        self.report(&run, RunEvent::Enqueued);
        self.report(&run, RunEvent::Running);

        let spec = LaunchSpec {
            socket_path: socket.path().to_path_buf(),
            mode: WorkerMode::Run,
            run_id: Some(run.id.clone()),
        };
        let host: Arc<dyn SubtaskHost> = this.clone();
        let (server, outcome_rx) = InvocationServer::start(
            socket,
            InvocationMode::Run {
                run_id: run.id.clone(),
                task_name: run.task_name.clone(),
                input: run.input.clone(),
            },
            Some(host),
            self.config.max_frame_bytes,
            &self.cancel,
        );

        let worker = match self.launcher.launch(spec).await {
            Ok(worker) => worker,
            Err(e) => {
                server.abandon("worker failed to start");
                let message = format!("failed to start worker: {e}");
                match self.store.fail_task_run(&run.id, message).await {
                    Ok(failed) => self.report(&failed, RunEvent::Failed),
                    Err(store_err) => warn!(run_id = %run.id, error = %store_err, "Failed to record spawn failure"),
                }
                return Err(CoordinatorError::Spawn(e));
            }
        };

        info!(run_id = %run.id, task = %run.task_name, pid = ?worker.pid(), "Run launched");
        self.tracker
            .spawn(this.supervise_run(run.id.clone(), server, outcome_rx, worker));

        Ok(run)
    }

    async fn supervise_run(
        self: Arc<Self>,
        run_id: RunId,
        server: InvocationServer,
        mut outcome_rx: oneshot::Receiver<InvocationOutcome>,
        worker: WorkerHandle,
    ) {
        let settled = self
            .settle(&mut outcome_rx, &worker, self.config.run_timeout(), &self.cancel)
            .await;

        let outcome = match settled {
            Settled::Outcome(InvocationOutcome::Finished(outcome)) => outcome,
            Settled::Outcome(InvocationOutcome::Registered(_)) => {
                RunOutcome::Failed("worker registered tasks instead of finishing the run".into())
            }
            Settled::Exited(exit) => abandon_or_take(
                &server,
                &mut outcome_rx,
                format!("worker exited ({exit}) without reporting a result"),
            ),
            Settled::TimedOut(limit) => abandon_or_take(
                &server,
                &mut outcome_rx,
                format!("run timed out after {}s", limit.as_secs()),
            ),
            Settled::Cancelled => {
                abandon_or_take(&server, &mut outcome_rx, SHUTDOWN_MESSAGE.to_string())
            }
            Settled::Closed => RunOutcome::Failed("invocation closed without a result".into()),
        };

        worker.terminate();
        server.shutdown();

        match self.store.finish_task_run(&run_id, outcome).await {
            Ok(run) => {
                let event = match run.status {
                    RunStatus::Complete => RunEvent::Completed,
                    _ => RunEvent::Failed,
                };
                self.report(&run, event);
            }
            Err(CoreError::InvalidStateTransition { .. }) => {
                debug!(run_id = %run_id, "Run already finished");
            }
            Err(e) => error!(run_id = %run_id, error = %e, "Failed to record run outcome"),
        }
    }

    /// Wait for the invocation outcome, the worker's exit, a timeout or cancellation.
    ///
    /// After an exit, a late outcome still wins if it lands within the exit grace.
    async fn settle(
        &self,
        outcome_rx: &mut oneshot::Receiver<InvocationOutcome>,
        worker: &WorkerHandle,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Settled {
        let deadline = async {
            match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        // Cancellation kills the worker too, so it must win over the exit.
        tokio::select! {
            biased;
            outcome = &mut *outcome_rx => match outcome {
                Ok(outcome) => Settled::Outcome(outcome),
                Err(_) => Settled::Closed,
            },
            _ = cancel.cancelled() => Settled::Cancelled,
            _ = self.cancel.cancelled() => Settled::Cancelled,
            limit = deadline => Settled::TimedOut(limit),
            exit = worker.wait() => {
                match tokio::time::timeout(self.config.exit_grace(), &mut *outcome_rx).await {
                    Ok(Ok(outcome)) => Settled::Outcome(outcome),
                    _ => Settled::Exited(exit),
                }
            }
        }
    }

    /// Look up a run.
    pub async fn describe_run(&self, run_id: &RunId) -> Result<Run, CoordinatorError> {
        self.store
            .get_run(run_id)
            .await
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()).into())
    }

    /// Runs of the task matching `identifier`, oldest first.
    pub async fn list_runs(&self, identifier: &str) -> Result<Vec<Run>, CoordinatorError> {
        Ok(self.store.get_task_runs(identifier).await?)
    }

    /// Kill every worker, wait for supervision tasks, and fail any run left running.
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.tracker.len(),
                "Supervision tasks still running at shutdown"
            );
        }
        self.store.fail_running_runs(SHUTDOWN_MESSAGE).await;
    }

    fn report(&self, run: &Run, event: RunEvent) {
        if let Some(reporter) = &self.reporter {
            reporter.report(run, event);
        }
    }
}

/// Fail an invocation that has not resolved, or take the outcome that just
/// landed.
fn abandon_or_take(
    server: &InvocationServer,
    outcome_rx: &mut oneshot::Receiver<InvocationOutcome>,
    reason: String,
) -> RunOutcome {
    if server.abandon(&reason) {
        return RunOutcome::Failed(reason);
    }
    match outcome_rx.try_recv() {
        Ok(InvocationOutcome::Finished(outcome)) => outcome,
        _ => RunOutcome::Failed(reason),
    }
}

#[async_trait]
impl SubtaskHost for Coordinator {
    async fn start_subtask(
        &self,
        parent: &RunId,
        task_name: &str,
        input: Value,
    ) -> Result<RunId, CoordinatorError> {
        let run = self
            .start_task(task_name, payload::encode(&input), Some(parent.clone()))
            .await?;
        Ok(run.id)
    }

    async fn subtask_result(&self, run_id: &RunId) -> Result<SubtaskResult, CoordinatorError> {
        let run = self.describe_run(run_id).await?;
        Ok(match run.status {
            RunStatus::Running => SubtaskResult::StillRunning {},
            RunStatus::Complete => SubtaskResult::Complete {
                output: payload::decode(&run.output),
            },
            RunStatus::Failed => SubtaskResult::Error {
                details: run.error.unwrap_or_default(),
            },
        })
    }
}
