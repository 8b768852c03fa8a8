//! taskhost orchestrator

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use taskhost_runtime::{
    http, AppState, Config, Coordinator, LogStore, ProcessSupervisor, StatusReporter,
    TaskRunStore,
};

/// Run tasks from a worker program and serve their state over HTTP.
#[derive(Parser, Debug)]
#[command(name = "taskhost", about = "Local task orchestrator")]
struct Args {
    /// HTTP server address
    #[arg(long, default_value = "127.0.0.1:4040")]
    http_addr: String,

    /// Fail runs that take longer than this many seconds
    #[arg(long)]
    run_timeout_secs: Option<u64>,

    /// Milliseconds to wait for a result after a worker exits
    #[arg(long, default_value = "2000")]
    exit_grace_ms: u64,

    /// Seconds between heartbeats on streaming connections
    #[arg(long, default_value = "15")]
    heartbeat_interval_secs: u64,

    /// Reconnect delay advertised to event-stream clients, in milliseconds
    #[arg(long, default_value = "3000")]
    sse_retry_ms: u64,

    /// Buffered entries per live log subscriber
    #[arg(long, default_value = "1024")]
    log_subscriber_capacity: usize,

    /// Completion notifications buffered per run subscriber
    #[arg(long, default_value = "256")]
    completion_channel_capacity: usize,

    /// Largest RPC frame accepted from a worker, in bytes
    #[arg(long, default_value = "16777216")]
    max_frame_bytes: usize,

    /// Do not copy worker output to this terminal
    #[arg(long)]
    no_echo: bool,

    /// Do not print run status lines
    #[arg(short, long)]
    quiet: bool,

    /// Worker program and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    worker: Vec<String>,
}

impl Args {
    fn into_config(self) -> Config {
        let mut worker = self.worker.into_iter();
        let command = worker.next().unwrap_or_default();
        Config {
            http_addr: self.http_addr,
            run_timeout_secs: self.run_timeout_secs,
            exit_grace_ms: self.exit_grace_ms,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            sse_retry_ms: self.sse_retry_ms,
            log_subscriber_capacity: self.log_subscriber_capacity,
            completion_channel_capacity: self.completion_channel_capacity,
            max_frame_bytes: self.max_frame_bytes,
            echo_worker_output: !self.no_echo,
            ..Config::for_worker(command, worker.collect())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let quiet = args.quiet;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taskhost=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(args.into_config());
    let http_addr: SocketAddr = config.http_addr.parse()?;

    let cancel = CancellationToken::new();
    let logs = Arc::new(LogStore::new(config.log_subscriber_capacity));
    let store = Arc::new(TaskRunStore::new(config.completion_channel_capacity));
    let launcher = Arc::new(ProcessSupervisor::new(
        config.clone(),
        logs.clone(),
        cancel.clone(),
    ));
    let reporter = (!quiet).then(|| Arc::new(StatusReporter::stderr()));

    let coordinator = Coordinator::new(
        config.clone(),
        store,
        logs,
        launcher,
        reporter,
        cancel.clone(),
    )?;

    info!(worker = %config.worker_command, "Discovering tasks");
    match coordinator.populate_tasks(&cancel).await {
        Ok(tasks) => info!(count = tasks.len(), "Tasks discovered"),
        Err(e) => warn!(error = %e, "Initial task discovery failed"),
    }

    let state = Arc::new(AppState::new(coordinator.clone(), cancel.clone()));
    let router = http::create_router(state);

    let listener = TcpListener::bind(http_addr).await?;
    info!(http_addr = %http_addr, "HTTP server listening");

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => {
                error!(error = %e, "Failed to listen for interrupt");
                return;
            }
        }
        signal_cancel.cancel();
    });

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;
    if let Err(e) = &result {
        error!(error = %e, "HTTP server error");
    }

    coordinator.shutdown().await;
    info!("taskhost stopped");

    result.map_err(Into::into)
}
