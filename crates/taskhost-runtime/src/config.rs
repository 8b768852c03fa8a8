//! Orchestrator configuration.

use std::time::Duration;

use taskhost_proto::DEFAULT_MAX_FRAME_BYTES;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Program launched for every worker invocation.
    pub worker_command: String,

    /// Arguments passed to the worker program.
    pub worker_args: Vec<String>,

    /// HTTP server bind address.
    pub http_addr: String,

    /// Reconnect delay advertised to event-stream clients (milliseconds).
    pub sse_retry_ms: u64,

    /// Interval between heartbeats on streaming connections (seconds).
    pub heartbeat_interval_secs: u64,

    /// How long to wait for a late callback after the worker exits (milliseconds).
    pub exit_grace_ms: u64,

    /// Fail runs that take longer than this. `None` waits forever.
    pub run_timeout_secs: Option<u64>,

    /// Buffered entries per live log subscription before entries are dropped.
    pub log_subscriber_capacity: usize,

    /// Buffered completion notifications per subscriber before the oldest are dropped.
    pub completion_channel_capacity: usize,

    /// Copy worker stdout/stderr to the orchestrator's own stdout/stderr.
    pub echo_worker_output: bool,

    /// Largest protocol line accepted from a worker.
    pub max_frame_bytes: usize,
}

impl Config {
    /// Configuration for launching `command` with `args`, defaults elsewhere.
    pub fn for_worker(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            worker_command: command.into(),
            worker_args: args,
            ..Self::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sse_retry(&self) -> Duration {
        Duration::from_millis(self.sse_retry_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_command: String::new(),
            worker_args: Vec::new(),
            http_addr: "127.0.0.1:4040".to_string(),
            sse_retry_ms: 3000,
            heartbeat_interval_secs: 15,
            exit_grace_ms: 2000,
            run_timeout_secs: None,
            log_subscriber_capacity: 1024,
            completion_channel_capacity: 256,
            echo_worker_output: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
