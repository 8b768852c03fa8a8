//! Log query and live tail handlers.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use taskhost_core::{LogFilter, RunId};

use crate::http::responses::{ApiError, LogResponse};
use crate::state::AppState;

/// Filter parameters shared by the query and the live tail.
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// Comma-separated run ids.
    #[serde(rename = "taskRunID")]
    pub task_run_id: Option<String>,

    /// RFC 3339, inclusive.
    #[serde(rename = "startTime")]
    pub start_time: Option<String>,

    /// RFC 3339, inclusive.
    #[serde(rename = "endTime")]
    pub end_time: Option<String>,

    /// Regular expression, or a literal substring if it does not compile.
    pub text: Option<String>,
}

impl LogQuery {
    pub fn to_filter(&self) -> Result<LogFilter, ApiError> {
        let mut filter = LogFilter::new();

        if let Some(ids) = self.task_run_id.as_deref() {
            filter = filter.with_run_ids(
                ids.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(RunId::new),
            );
        }
        if let Some(start) = non_empty(&self.start_time) {
            filter = filter.with_start_time(parse_time("startTime", start)?);
        }
        if let Some(end) = non_empty(&self.end_time) {
            filter = filter.with_end_time(parse_time("endTime", end)?);
        }
        if let Some(text) = non_empty(&self.text) {
            filter = filter.with_text(text);
        }
        Ok(filter)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::BadRequest(format!("Invalid {field} '{value}': {e}")))
}

/// One-shot query over captured worker output.
pub async fn query_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogResponse>>, ApiError> {
    let filter = query.to_filter()?;
    let entries = state.logs.get_logs(&filter);
    Ok(Json(entries.iter().map(LogResponse::from).collect()))
}

/// Live tail over a WebSocket, one JSON text frame per entry.
pub async fn subscribe_logs(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let filter = query.to_filter()?;
    Ok(ws.on_upgrade(move |socket| live_tail(socket, state, filter)))
}

async fn live_tail(mut socket: WebSocket, state: Arc<AppState>, filter: LogFilter) {
    let mut subscription = state.logs.log_chan(filter);
    let mut ping = tokio::time::interval(state.config.heartbeat_interval());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;
    info!("Log tail opened");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            entry = subscription.recv() => {
                let Some(entry) = entry else { break };
                let frame = match serde_json::to_string(&LogResponse::from(&entry)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "Failed to encode log entry");
                        continue;
                    }
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.logs.remove_log_chan(&mut subscription);
    info!("Log tail closed");
}
