//! Run completion event stream.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use taskhost_core::{Run, RunId};

use crate::http::responses::RunDetailResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated run ids.
    #[serde(rename = "taskRunIds", default)]
    pub task_run_ids: String,
}

fn parse_run_ids(raw: &str) -> Vec<RunId> {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(RunId::new)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn run_event(run: &Run) -> Event {
    Event::default()
        .event("taskRun")
        .id(run.id.as_str())
        .json_data(RunDetailResponse::from(run))
        .unwrap_or_else(|e| {
            warn!(run_id = %run.id, error = %e, "Failed to encode run event");
            Event::default().comment("encoding error")
        })
}

/// Stream one event per requested run once it finishes.
///
/// Runs that already finished are sent right after the retry preamble, so a
/// reconnecting client catches up without a cursor. Each run is sent at most
/// once per connection.
pub async fn task_run_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let requested = parse_run_ids(&query.task_run_ids);
    if let Some(last) = headers.get("last-event-id").and_then(|v| v.to_str().ok()) {
        info!(last_event_id = last, "Event stream reconnected");
    }
    info!(runs = requested.len(), "Event stream opened");

    // Subscribe before the snapshot so nothing finishing in between is missed.
    let subscription = state.store.add_task_run_subscriber();

    let mut emitted = HashSet::new();
    let mut initial = vec![Event::default().retry(state.config.sse_retry())];
    for id in &requested {
        if let Some(run) = state.store.get_run(id).await {
            if run.status.is_terminal() && emitted.insert(run.id.clone()) {
                initial.push(run_event(&run));
            }
        }
    }

    let wanted: HashSet<RunId> = requested.into_iter().collect();
    let live = BroadcastStream::new(subscription.into_receiver())
        .filter_map(move |item| {
            let event = match item {
                Ok(run) if wanted.contains(&run.id) && emitted.insert(run.id.clone()) => {
                    Some(Ok(run_event(&run)))
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged, skipping runs");
                    None
                }
            };
            std::future::ready(event)
        })
        .take_until(state.shutdown.clone().cancelled_owned());

    let events = stream::iter(initial.into_iter().map(Ok)).chain(live);
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.config.heartbeat_interval())
            .text("heartbeat"),
    )
}
