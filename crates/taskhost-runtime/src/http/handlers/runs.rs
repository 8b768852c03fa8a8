//! Run submission and lookup handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use taskhost_core::RunId;

use crate::http::responses::{
    ApiError, CreateTaskRunRequest, RunDetailResponse, RunSummaryResponse,
};
use crate::payload;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(rename = "taskId")]
    pub task_id: Option<String>,
}

/// Start a run. Responds 202 with the run still `running`.
pub async fn create_task_run(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateTaskRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RunSummaryResponse>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let run = state
        .coordinator
        .start_task(&request.task, payload::encode(&request.input), None)
        .await?;
    info!(run_id = %run.id, task = %run.task_name, "Run submitted over HTTP");

    Ok((StatusCode::ACCEPTED, Json(RunSummaryResponse::from(&run))))
}

pub async fn list_task_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunSummaryResponse>>, ApiError> {
    let task_id = query
        .task_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("taskId is required".into()))?;

    let runs = state.coordinator.list_runs(&task_id).await?;
    Ok(Json(runs.iter().map(RunSummaryResponse::from).collect()))
}

pub async fn get_task_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunDetailResponse>, ApiError> {
    let run = state.coordinator.describe_run(&RunId::new(id)).await?;
    Ok(Json(RunDetailResponse::from(&run)))
}
