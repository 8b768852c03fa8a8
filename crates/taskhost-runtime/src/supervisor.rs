//! Worker process launching and teardown.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskhost_core::RunId;
use taskhost_proto::{WorkerMode, MODE_ENV, SOCKET_PATH_ENV};

use crate::config::Config;
use crate::logs::{LogInterceptor, LogStore, Passthrough};

/// How long to keep draining output pipes after the worker exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What a worker needs to find its invocation server.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub socket_path: PathBuf,
    pub mode: WorkerMode,
    /// Run the captured output is attributed to. `None` for discovery.
    pub run_id: Option<RunId>,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
    /// The exit status could not be collected.
    Unknown(String),
}

impl WorkerExit {
    pub fn from_status(status: io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => match (status.code(), status.signal()) {
                (Some(code), _) => Self::Code(code),
                (None, Some(signal)) => Self::Signal(signal),
                (None, None) => Self::Unknown(status.to_string()),
            },
            Err(e) => Self::Unknown(e.to_string()),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Unknown(reason) => write!(f, "unknown status: {reason}"),
        }
    }
}

/// A running worker.
///
/// Dropping the handle terminates the worker.
pub struct WorkerHandle {
    pid: Option<u32>,
    kill: CancellationToken,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerHandle {
    /// Build a handle around a kill token and an exit notification.
    ///
    /// Launchers publish the exit on `exit_rx` once and watch `kill` to tear
    /// the worker down.
    pub fn new(
        pid: Option<u32>,
        kill: CancellationToken,
        exit_rx: watch::Receiver<Option<WorkerExit>>,
    ) -> Self {
        Self { pid, kill, exit_rx }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Force-terminate the worker and everything it started.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    /// Wait for the worker to exit.
    pub async fn wait(&self) -> WorkerExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return WorkerExit::Unknown("launcher dropped the exit notification".into());
            }
        }
    }

    pub fn try_exit(&self) -> Option<WorkerExit> {
        self.exit_rx.borrow().clone()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

/// Starts workers for invocations.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> io::Result<WorkerHandle>;
}

/// Launches the configured worker command as its own process group.
///
/// Every worker's kill token is a child of the supervisor's lifetime token,
/// so cancelling the lifetime kills all workers.
pub struct ProcessSupervisor {
    config: Arc<Config>,
    logs: Arc<LogStore>,
    cancel: CancellationToken,
}

impl ProcessSupervisor {
    pub fn new(config: Arc<Config>, logs: Arc<LogStore>, cancel: CancellationToken) -> Self {
        Self {
            config,
            logs,
            cancel,
        }
    }

    fn passthrough(&self, stdout: bool) -> Passthrough {
        match (self.config.echo_worker_output, stdout) {
            (false, _) => Passthrough::Discard,
            (true, true) => Passthrough::Stdout,
            (true, false) => Passthrough::Stderr,
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessSupervisor {
    async fn launch(&self, spec: LaunchSpec) -> io::Result<WorkerHandle> {
        let mut cmd = Command::new(&self.config.worker_command);
        cmd.args(&self.config.worker_args)
            .env(SOCKET_PATH_ENV, &spec.socket_path)
            .env(MODE_ENV, spec.mode.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!(command = %self.config.worker_command, error = %e, "Failed to spawn worker");
            e
        })?;
        let pid = child.id();
        info!(
            pid = ?pid,
            mode = %spec.mode,
            run_id = ?spec.run_id.as_ref().map(RunId::as_str),
            "Worker spawned"
        );

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let interceptor =
                LogInterceptor::new(self.logs.clone(), spec.run_id.clone(), self.passthrough(true));
            pumps.push(tokio::spawn(interceptor.pump(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            let interceptor =
                LogInterceptor::new(self.logs.clone(), spec.run_id.clone(), self.passthrough(false));
            pumps.push(tokio::spawn(interceptor.pump(stderr)));
        }

        let kill = self.cancel.child_token();
        let (exit_tx, exit_rx) = watch::channel(None);

        let watcher_kill = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = watcher_kill.cancelled() => {
                    kill_process_group(pid);
                    child.wait().await
                }
            };

            let drain = futures_util::future::join_all(pumps);
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
                debug!(pid = ?pid, "Worker output still open after exit");
            }

            let exit = WorkerExit::from_status(status);
            info!(pid = ?pid, exit = %exit, "Worker exited");
            let _ = exit_tx.send(Some(exit));

            // Anything the worker left behind in its group goes too, unless
            // the leader's pid now belongs to someone else.
            watcher_kill.cancelled().await;
            if pid.is_some_and(pid_in_use) {
                debug!(pid = ?pid, "Worker pid reused, leaving its group alone");
            } else {
                kill_process_group(pid);
            }
        });

        Ok(WorkerHandle::new(pid, kill, exit_rx))
    }
}

fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => debug!(pgid = pid, "Killed worker process group"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, error = %e, "Failed to kill worker process group"),
    }
}

/// Whether any live process currently holds `pid`.
///
/// Once a group leader has been reaped, a live process with its pid means the
/// id was recycled and the group number may name somebody else's group.
fn pid_in_use(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(nix::errno::Errno::ESRCH))
}
