//! HTTP request handlers.

mod events;
mod health;
mod logs;
mod runs;
mod tasks;

pub use events::task_run_events;
pub use health::health_check;
pub use logs::{query_logs, subscribe_logs};
pub use runs::{create_task_run, get_task_run, list_task_runs};
pub use tasks::{get_task, list_tasks};
