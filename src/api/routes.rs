//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::llm::{GeminiClient, ModelGateway};
use crate::pipeline::{Pipeline, RunSnapshot, SubmitError};

use super::types::*;

/// Interval between SSE keepalive comments.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// The single pipeline every submission goes through
    pub pipeline: Pipeline,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/task", post(create_task))
        .route("/api/run", get(get_run))
        .route("/api/run/stream", get(stream_run))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let client = Arc::new(GeminiClient::from_config(&config));
    let pipeline = Pipeline::new(ModelGateway::new(client));

    let state = Arc::new(AppState {
        config: config.clone(),
        pipeline,
    });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.config.model.clone(),
    })
}

/// Submit a new task. Rejected while another run is in progress.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), (StatusCode, String)> {
    match state.pipeline.submit(&req.task) {
        Ok(submission) => {
            tracing::info!(run_id = %submission.run_id, "Task accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(CreateTaskResponse {
                    run_id: submission.run_id,
                }),
            ))
        }
        Err(e @ SubmitError::EmptyTask) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        Err(e @ SubmitError::RunInProgress) => Err((StatusCode::CONFLICT, e.to_string())),
    }
}

/// Get the latest run snapshot.
async fn get_run(State(state): State<Arc<AppState>>) -> Json<Arc<RunSnapshot>> {
    Json(state.pipeline.snapshot().await)
}

/// Stream run snapshots via SSE.
async fn stream_run(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.pipeline.subscribe();
    // Subscribe first so nothing published in between is missed.
    let initial = state.pipeline.snapshot().await;
    let pipeline = state.pipeline.clone();

    let stream = async_stream::stream! {
        yield Ok(snapshot_event(&initial));

        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    yield Ok(snapshot_event(&snapshot));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Snapshot stream lagged");
                    yield Ok(Event::default()
                        .event("error")
                        .data("snapshot stream lagged; some snapshots were dropped"));
                    // Catch up with the latest state.
                    let latest = pipeline.snapshot().await;
                    yield Ok(snapshot_event(&latest));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

fn snapshot_event(snapshot: &RunSnapshot) -> Event {
    Event::default()
        .event("snapshot")
        .json_data(snapshot)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use futures::StreamExt;
    use crate::llm::LlmError;
    use crate::pipeline::PipelinePhase;
    use crate::testing::{ScriptedClient, StreamScript};

    /// Pull the next SSE frame and split it into its event name and JSON payload.
    async fn next_event<S>(body: &mut S) -> (String, serde_json::Value)
    where
        S: Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin,
    {
        let frame = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        let mut name = String::new();
        let mut data = String::new();
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("event: ") {
                name = value.to_string();
            } else if let Some(value) = line.strip_prefix("data: ") {
                data.push_str(value);
            }
        }
        let payload = serde_json::from_str(&data).unwrap_or(serde_json::Value::String(data));
        (name, payload)
    }

    fn state(client: ScriptedClient) -> Arc<AppState> {
        Arc::new(AppState {
            config: Config::new("test-key".to_string(), "gemini-test".to_string()),
            pipeline: Pipeline::new(ModelGateway::new(Arc::new(client))),
        })
    }

    #[tokio::test]
    async fn test_health_reports_model() {
        let Json(body) = health(State(state(ScriptedClient::new()))).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.model, "gemini-test");
    }

    #[tokio::test]
    async fn test_create_task_rejects_empty_text() {
        let state = state(ScriptedClient::new());
        let request = CreateTaskRequest {
            task: "  ".to_string(),
        };

        let (status, _) = create_task(State(state), Json(request)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_task_accepts_then_conflicts() {
        let state = state(
            ScriptedClient::new()
                .with_plan(&["a"])
                .with_stream(StreamScript::text(&["think"]))
                .with_stream(StreamScript::text(&["result"]))
                .with_stream(StreamScript::text(&["answer"])),
        );
        let mut events = state.pipeline.subscribe();

        let (status, Json(body)) = create_task(
            State(state.clone()),
            Json(CreateTaskRequest {
                task: "Plan a trip".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        // The first submission holds the active flag until its run finishes.
        let (status, _) = create_task(
            State(state.clone()),
            Json(CreateTaskRequest {
                task: "Another".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);

        loop {
            let snapshot = events.recv().await.unwrap();
            if snapshot.phase == PipelinePhase::Done {
                assert_eq!(snapshot.run_id, Some(body.run_id));
                break;
            }
        }
        let Json(latest) = get_run(State(state)).await;
        assert_eq!(latest.final_answer, "answer");
    }

    #[tokio::test]
    async fn test_stream_run_sends_initial_snapshot_then_each_publish() {
        let state = state(
            ScriptedClient::new()
                .with_decomposition(Err(LlmError::server_error(503, "overloaded".to_string()))),
        );
        let mut body = stream_run(State(state.clone()))
            .await
            .into_response()
            .into_body()
            .into_data_stream();

        state.pipeline.run("Plan a trip").await.unwrap();

        let (name, initial) = next_event(&mut body).await;
        assert_eq!(name, "snapshot");
        assert_eq!(initial["phase"], "idle");
        assert!(initial["runId"].is_null());

        let (name, decomposing) = next_event(&mut body).await;
        assert_eq!(name, "snapshot");
        assert_eq!(decomposing["phase"], "decomposing");
        assert_eq!(decomposing["sequence"], 1);

        let (name, failed) = next_event(&mut body).await;
        assert_eq!(name, "snapshot");
        assert_eq!(failed["phase"], "idle");
        assert_eq!(failed["sequence"], 2);
        assert!(failed["error"].is_string());
        assert_eq!(failed["runId"], decomposing["runId"]);
    }

    #[tokio::test]
    async fn test_stream_run_reports_lag_then_catches_up() {
        let deltas = vec!["x"; 1100];
        let state = state(
            ScriptedClient::new()
                .with_plan(&["a"])
                .with_stream(StreamScript::text(&deltas))
                .with_stream(StreamScript::text(&["result"]))
                .with_stream(StreamScript::text(&["answer"])),
        );
        let mut body = stream_run(State(state.clone()))
            .await
            .into_response()
            .into_body()
            .into_data_stream();

        // Nothing reads the stream while the run publishes past the channel capacity.
        let finished = state.pipeline.run("Plan a trip").await.unwrap();
        assert_eq!(finished.phase, PipelinePhase::Done);

        let (name, initial) = next_event(&mut body).await;
        assert_eq!(name, "snapshot");
        assert_eq!(initial["phase"], "idle");

        let (name, notice) = next_event(&mut body).await;
        assert_eq!(name, "error");
        assert!(notice.as_str().unwrap().contains("lagged"));

        let (name, latest) = next_event(&mut body).await;
        assert_eq!(name, "snapshot");
        assert_eq!(latest["phase"], "done");
        assert_eq!(latest["finalAnswer"], "answer");
        assert_eq!(latest["sequence"], finished.sequence);
    }

    #[tokio::test]
    async fn test_get_run_before_any_submission_is_idle() {
        let Json(snapshot) = get_run(State(state(ScriptedClient::new()))).await;
        assert_eq!(snapshot.phase, PipelinePhase::Idle);
        assert!(snapshot.run_id.is_none());
    }
}
