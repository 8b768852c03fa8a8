//! Shared state for HTTP handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::logs::LogStore;
use crate::store::TaskRunStore;

/// Everything the HTTP handlers reach into.
pub struct AppState {
    pub config: Arc<Config>,
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<TaskRunStore>,
    pub logs: Arc<LogStore>,
    /// Ends streaming connections when the server shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, shutdown: CancellationToken) -> Self {
        Self {
            config: coordinator.config().clone(),
            store: coordinator.store().clone(),
            logs: coordinator.logs().clone(),
            coordinator,
            shutdown,
        }
    }
}
