//! HTTP server for the orchestrator.
//!
//! Provides endpoints for:
//! - Task catalogue (`/tasks`)
//! - Run submission, lookup and completion events (`/task-runs`)
//! - Worker log queries and live tail (`/logs`)
//! - Health check (`/health`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS layer for devtools access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/:id", get(handlers::get_task))
        .route(
            "/task-runs",
            post(handlers::create_task_run).get(handlers::list_task_runs),
        )
        .route("/task-runs/events", get(handlers::task_run_events))
        .route("/task-runs/:id", get(handlers::get_task_run))
        .route("/logs", get(handlers::query_logs))
        .route("/logs/subscribe", get(handlers::subscribe_logs))
        .route("/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::coordinator::Coordinator;
    use crate::logs::LogStore;
    use crate::store::TaskRunStore;
    use crate::testing::{wait_for_terminal, FakeLauncher};
    use taskhost_core::{LogEntry, RunId};

    fn app() -> (Router, Arc<AppState>) {
        let mut config = Config::for_worker("fake-worker", Vec::new());
        config.exit_grace_ms = 50;
        let config = Arc::new(config);
        let logs = Arc::new(LogStore::new(64));
        let store = Arc::new(TaskRunStore::new(16));
        let cancel = CancellationToken::new();
        let coordinator = Coordinator::new(
            config,
            store,
            logs.clone(),
            Arc::new(FakeLauncher::new(logs)),
            None,
            cancel.clone(),
        )
        .unwrap();
        let state = Arc::new(AppState::new(coordinator, cancel));
        (create_router(state.clone()), state)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Next text frame from a live tail, decoded, skipping pings.
    async fn next_log<S>(socket: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("no log frame in time")
                .unwrap()
                .unwrap();
            match message {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    fn frame_text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).replace(": ", ":")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_list_and_get_tasks() {
        let (app, _) = app();
        let (status, body) = send(&app, get("/tasks")).await;
        assert_eq!(status, StatusCode::OK);
        let tasks = body.as_array().unwrap();
        assert!(tasks.iter().any(|t| t["name"] == "double"));

        let id = tasks[0]["id"].as_str().unwrap();
        let (status, body) = send(&app, get(&format!("/tasks/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id);

        let (status, body) = send(&app, get("/tasks/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_submit_and_describe_run() {
        let (app, state) = app();

        let (status, body) =
            send(&app, post_json("/task-runs", r#"{"task":"double","input":[21]}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "running");
        let run_id = body["id"].as_str().unwrap().to_string();

        wait_for_terminal(&state.store, &RunId::new(run_id.clone())).await;
        let (status, body) = send(&app, get(&format!("/task-runs/{run_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "complete");
        assert_eq!(body["results"], json!([42]));

        let (status, body) = send(&app, get("/task-runs?taskId=double")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_errors() {
        let (app, _) = app();

        let (status, _) = send(&app, post_json("/task-runs", r#"{"task":"nope"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, post_json("/task-runs", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].is_string());

        let (status, _) = send(&app, get("/task-runs")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get("/task-runs/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logs_query() {
        let (app, state) = app();

        let (_, body) =
            send(&app, post_json("/task-runs", r#"{"task":"double","input":[1,2,3]}"#)).await;
        let run_id = body["id"].as_str().unwrap().to_string();
        wait_for_terminal(&state.store, &RunId::new(run_id.clone())).await;

        let (status, body) = send(&app, get(&format!("/logs?taskRunID={run_id}&text=doubling"))).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["taskRunId"], run_id.as_str());
        assert_eq!(entries[0]["message"], "doubling 3 values");

        let (status, _) = send(&app, get("/logs?startTime=soon")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_event_stream_starts_with_retry_and_waits() {
        let (app, _) = app();

        let response = app
            .clone()
            .oneshot(get("/task-runs/events?taskRunIds=unknown"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(frame_text(&first).starts_with("retry:3000"));

        let next = tokio::time::timeout(Duration::from_millis(200), body.next()).await;
        assert!(next.is_err(), "no data frame before a requested run finishes");
    }

    #[tokio::test]
    async fn test_event_stream_emits_finished_run() {
        let (app, state) = app();

        let (_, body) =
            send(&app, post_json("/task-runs", r#"{"task":"flaky"}"#)).await;
        let run_id = body["id"].as_str().unwrap().to_string();
        wait_for_terminal(&state.store, &RunId::new(run_id.clone())).await;

        let response = app
            .clone()
            .oneshot(get(&format!("/task-runs/events?taskRunIds={run_id}")))
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();
        body.next().await.unwrap().unwrap();

        let frame = body.next().await.unwrap().unwrap();
        let frame = frame_text(&frame);
        assert!(frame.contains("event:taskRun"));
        assert!(frame.contains(&format!("id:{run_id}")));
        assert!(frame.contains("\"error\":\"boom\""));
    }

    #[tokio::test]
    async fn test_event_stream_delivers_live_completions_once() {
        let (app, state) = app();
        let done = state.store.start_task_run("double", Vec::new(), None).await.unwrap();
        state.store.complete_task_run(&done.id, b"2".to_vec()).await.unwrap();
        let pending = state.store.start_task_run("double", Vec::new(), None).await.unwrap();
        let unrelated = state.store.start_task_run("double", Vec::new(), None).await.unwrap();

        let uri = format!(
            "/task-runs/events?taskRunIds={},{},{}",
            done.id, pending.id, done.id
        );
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        let mut body = response.into_body().into_data_stream();
        body.next().await.unwrap().unwrap();

        let snapshot = frame_text(&body.next().await.unwrap().unwrap());
        assert!(snapshot.contains(&format!("id:{}", done.id)));

        state.store.complete_task_run(&unrelated.id, Vec::new()).await.unwrap();
        state.store.fail_task_run(&pending.id, "late").await.unwrap();

        let live = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let live = frame_text(&live);
        assert!(live.contains(&format!("id:{}", pending.id)));
        assert!(live.contains("\"error\":\"late\""));

        state.shutdown.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), body.next()).await;
        assert!(matches!(end, Ok(None)), "stream ends on shutdown");
    }

    #[tokio::test]
    async fn test_log_tail_replays_backlog_then_live_entries() {
        let (app, state) = app();
        let run = RunId::new("tail-run");
        state.logs.add_log(LogEntry::new(Some(run.clone()), "before"));

        let addr = serve(app).await;
        let url = format!(
            "ws://{addr}/logs/subscribe?taskRunID={run}&startTime=2000-01-01T00:00:00Z"
        );
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let first = next_log(&mut socket).await;
        assert_eq!(first["message"], "before");
        assert_eq!(first["taskRunId"], run.as_str());

        state.logs.add_log(LogEntry::new(Some(RunId::new("other-run")), "elsewhere"));
        state.logs.add_log(LogEntry::new(Some(run.clone()), "after"));
        assert_eq!(next_log(&mut socket).await["message"], "after");

        state.shutdown.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match socket.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "tail closes on shutdown");
    }

    #[tokio::test]
    async fn test_log_tail_unsubscribes_on_client_close() {
        let (app, state) = app();
        let run = RunId::new("closing-run");
        state.logs.add_log(LogEntry::new(Some(run.clone()), "hello"));

        let addr = serve(app).await;
        let url = format!(
            "ws://{addr}/logs/subscribe?taskRunID={run}&startTime=2000-01-01T00:00:00Z"
        );
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        assert_eq!(next_log(&mut socket).await["message"], "hello");
        assert_eq!(state.logs.subscriber_count(), 1);

        socket.send(WsMessage::Close(None)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.logs.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription removed after client close");
    }
}
