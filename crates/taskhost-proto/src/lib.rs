//! taskhost worker protocol
//!
//! Workers talk to the orchestrator over a private Unix socket using
//! newline-delimited JSON. Each line is a [`RequestFrame`] from the worker or
//! a [`ResponseFrame`] from the orchestrator, correlated by `id`.
//!
//! The worker learns where to connect and what to do from its environment:
//! [`SOCKET_PATH_ENV`] holds the socket path and [`MODE_ENV`] is `run` or
//! `register`.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use taskhost_proto::{WorkerClient, WorkerMode};
//!
//! async fn worker_main() -> Result<(), taskhost_proto::ProtoError> {
//!     let (client, mode) = WorkerClient::from_env().await?;
//!     match mode {
//!         WorkerMode::Register => client.register_tasks(["double"]).await?,
//!         WorkerMode::Run => {
//!             let input = client.get_input().await?;
//!             client.complete(json!({ "echo": input.input })).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod codec;
mod env;
mod error;
mod messages;

pub use client::WorkerClient;
pub use codec::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
pub use env::{WorkerMode, MODE_ENV, SOCKET_PATH_ENV};
pub use error::ProtoError;
pub use messages::{
    Ack, CallbackRequest, GetInputResponse, GetSubtaskResultRequest, RegisterTasksRequest,
    Request, RequestFrame, ResponseFrame, RunSubtaskRequest, RunSubtaskResponse, SubtaskResult,
};
