//! Task catalogue handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::http::responses::{ApiError, TaskResponse};
use crate::state::AppState;

/// List tasks after a fresh discovery pass.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let tasks = state.coordinator.populate_tasks(&state.shutdown).await?;
    Ok(Json(tasks.iter().map(TaskResponse::from).collect()))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .store
        .get_task(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {id}")))?;
    Ok(Json(TaskResponse::from(&task)))
}
