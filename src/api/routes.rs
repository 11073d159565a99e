//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
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
use crate::engine::{Engine, EngineError, EngineEvent};
use crate::task::{Task, TaskError, TaskId};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub engine: Engine,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/events", get(get_events))
        .route("/api/tasks/:id/resume", post(resume_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/stream", get(stream))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config, engine: Engine) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState { config, engine });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGTERM/SIGINT. Tasks still running are failed as interrupted on
/// the next start.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install signal handler: {}", e);
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

/// Map engine errors onto HTTP statuses.
fn error_response(e: EngineError) -> (StatusCode, String) {
    let status = match &e {
        EngineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::CheckpointConsumed(_)
        | EngineError::NotPaused(_)
        | EngineError::AlreadyFinished(_) => StatusCode::CONFLICT,
        EngineError::InvalidResumeStep { .. }
        | EngineError::InvalidTarget(_)
        | EngineError::Task(TaskError::EmptyDescription) => StatusCode::BAD_REQUEST,
        EngineError::Task(_) => StatusCode::CONFLICT,
        EngineError::Config(_) | EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.config.default_model.clone(),
        tasks: state.engine.list().await.len(),
        confidence_threshold: state.engine.config().confidence_threshold,
    })
}

/// Start a task.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, (StatusCode, String)> {
    let id = state
        .engine
        .start(&req.objective, req.bypass)
        .await
        .map_err(error_response)?;
    let task = state.engine.get(id).await.map_err(error_response)?;
    Ok(Json(CreateTaskResponse {
        id,
        status: task.status().clone(),
    }))
}

/// List all tasks.
async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskSummary>> {
    let tasks = state.engine.list().await;
    Json(tasks.iter().map(TaskSummary::from).collect())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Task>, (StatusCode, String)> {
    state.engine.get(id).await.map(Json).map_err(error_response)
}

async fn get_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Vec<EngineEvent>>, (StatusCode, String)> {
    state.engine.events(id).await.map(Json).map_err(error_response)
}

/// Resume a task with the operator's target.
async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<ResumeResponse>, (StatusCode, String)> {
    let from = state
        .engine
        .resume(id, &req.selected_ip, req.resume_from_step)
        .await
        .map_err(error_response)?;
    let task = state.engine.get(id).await.map_err(error_response)?;
    Ok(Json(ResumeResponse {
        id,
        resume_from_step: from,
        status: task.status().clone(),
    }))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state.engine.cancel(id).await.map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Cancellation requested"
    })))
}

fn sse_event(ev: &EngineEvent) -> Event {
    Event::default()
        .event(ev.event_name())
        .json_data(ev)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Stream engine events via SSE.
///
/// With `task_id`, the task's history is replayed first and live events are
/// de-duplicated against it by `seq`.
async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    // Subscribe before reading history so nothing falls in between
    let mut rx = state.engine.subscribe();
    let history = match query.task_id {
        Some(id) => state.engine.events(id).await.map_err(error_response)?,
        None => Vec::new(),
    };
    let filter = query.task_id;

    let stream = async_stream::stream! {
        let mut last_seq = 0u64;
        for ev in &history {
            last_seq = ev.seq;
            yield Ok(sse_event(ev));
        }

        let mut keepalive_interval = tokio::time::interval(std::time::Duration::from_secs(15));
        keepalive_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(ev) => {
                            if let Some(id) = filter {
                                if ev.task_id != id || ev.seq <= last_seq {
                                    continue;
                                }
                                last_seq = ev.seq;
                            }
                            yield Ok(sse_event(&ev));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let sse = Event::default()
                                .event("error")
                                .data(format!("event stream lagged; {} events were dropped", skipped));
                            yield Ok(sse);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = keepalive_interval.tick() => {
                    yield Ok(Event::default().comment("keepalive"));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}
