//! In-process workers for tests.
//!
//! [`FakeLauncher`] speaks the real protocol over the real socket with
//! [`WorkerClient`], so tests exercise everything but process spawning.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use taskhost_core::{Run, RunId};
use taskhost_proto::{ProtoError, SubtaskResult, WorkerClient, WorkerMode};

use crate::logs::{LogInterceptor, LogStore, Passthrough};
use crate::store::TaskRunStore;
use crate::supervisor::{LaunchSpec, WorkerExit, WorkerHandle, WorkerLauncher};

/// Tasks every fake worker registers.
pub const FAKE_TASKS: &[&str] = &["double", "flaky", "parent", "child", "silent", "slow"];

/// Launches fake workers as tokio tasks.
///
/// - `double` doubles every number in an array input.
/// - `flaky` fails with `boom`.
/// - `parent` runs `child` with its own input and returns the child's output.
/// - `child` echoes its input.
/// - `silent` exits with code 1 without reporting.
/// - `slow` never finishes.
pub struct FakeLauncher {
    logs: Arc<LogStore>,
    fail_runs: bool,
}

impl FakeLauncher {
    pub fn new(logs: Arc<LogStore>) -> Self {
        Self {
            logs,
            fail_runs: false,
        }
    }

    /// Refuse to launch run-mode workers.
    pub fn failing_runs(mut self) -> Self {
        self.fail_runs = true;
        self
    }

    pub fn logs(&self) -> &Arc<LogStore> {
        &self.logs
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec) -> io::Result<WorkerHandle> {
        if self.fail_runs && spec.mode == WorkerMode::Run {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fake worker missing"));
        }

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let interceptor = LogInterceptor::new(self.logs.clone(), spec.run_id.clone(), Passthrough::Discard);

        let token = kill.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                _ = token.cancelled() => WorkerExit::Signal(9),
                result = fake_worker(spec, interceptor) => match result {
                    Ok(code) => WorkerExit::Code(code),
                    Err(e) => WorkerExit::Unknown(e.to_string()),
                },
            };
            let _ = exit_tx.send(Some(exit));
        });

        Ok(WorkerHandle::new(None, kill, exit_rx))
    }
}

async fn fake_worker(spec: LaunchSpec, mut output: LogInterceptor) -> Result<i32, ProtoError> {
    let client = WorkerClient::connect(&spec.socket_path).await?;

    if spec.mode == WorkerMode::Register {
        client.register_tasks(FAKE_TASKS.iter().copied()).await?;
        return Ok(0);
    }

    let request = client.get_input().await?;
    let input = request.input.unwrap_or(Value::Null);
    match request.task_name.as_deref().unwrap_or_default() {
        "double" => {
            let values = input.as_array().cloned().unwrap_or_default();
            output.write(format!("doubling {} values\n", values.len()).as_bytes());
            let doubled: Vec<Value> = values
                .iter()
                .map(|v| Value::from(v.as_f64().unwrap_or(0.0) as i64 * 2))
                .collect();
            client.complete(Value::Array(doubled)).await?;
        }
        "flaky" => client.fail("boom").await?,
        "parent" => {
            let child = client.run_subtask("child", input).await?;
            match client
                .wait_for_subtask(&child, Duration::from_millis(10))
                .await?
            {
                SubtaskResult::Complete { output } => client.complete(output).await?,
                SubtaskResult::Error { details } => client.fail(details).await?,
                SubtaskResult::StillRunning {} => client.fail("child never finished").await?,
            }
        }
        "child" => client.complete(input).await?,
        "silent" => return Ok(1),
        "slow" => std::future::pending::<()>().await,
        other => client.fail(format!("unknown task {other}")).await?,
    }
    Ok(0)
}

/// Poll the store until the run is no longer running.
pub async fn wait_for_terminal(store: &TaskRunStore, run_id: &RunId) -> Run {
    let poll = async {
        loop {
            if let Some(run) = store.get_run(run_id).await {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("run did not finish in time")
}
