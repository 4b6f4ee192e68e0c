use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use curator_core::{TaskError, TaskManager, TaskRequest};
use curator_model::TaskStatus;

/// Interval between SSE keep-alive comments.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
    task_status: Option<TaskStatus>,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            task_status: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        let message = err.to_string();
        match err {
            TaskError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, message),
            TaskError::InvalidState { status, .. } => Self {
                status: StatusCode::CONFLICT,
                message,
                task_status: Some(status),
            },
            TaskError::InvalidTransition { from, .. } => Self {
                status: StatusCode::CONFLICT,
                message,
                task_status: Some(from),
            },
            TaskError::UnitUnavailable(_) => Self::new(StatusCode::SERVICE_UNAVAILABLE, message),
            TaskError::InvalidRequest(_) | TaskError::InvalidConfiguration(_) => {
                Self::bad_request(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = match self.task_status {
            Some(status) => serde_json::json!({ "error": self.message, "status": status }),
            None => serde_json::json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub max_parallel_tasks: usize,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(manager: TaskManager) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/counts", get(task_counts))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/withdraw", post(withdraw_task))
        .route("/api/tasks/{id}/progress", get(task_progress))
        .route("/api/settings", get(get_settings).put(put_settings))
        .layer(CorsLayer::permissive())
        .with_state(manager)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(manager: TaskManager, bind: &str, port: u16) -> Result<()> {
    let app = build_router(manager.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("curator serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;
    tracing::info!("curator serve shut down");
    Ok(())
}

/// Resolves on Ctrl+C after stopping every task, so open progress streams
/// reach their terminal snapshot and close.
async fn shutdown_signal(manager: TaskManager) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    manager.shutdown();
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(manager): State<TaskManager>,
    Query(query): Query<ListQuery>,
) -> Response {
    let tasks = if query.all {
        manager.all_tasks()
    } else {
        manager.active_tasks()
    };
    Json(tasks).into_response()
}

async fn create_task(
    State(manager): State<TaskManager>,
    Json(request): Json<TaskRequest>,
) -> Result<Response, AppError> {
    let created = manager.create_task(request).await?;
    Ok((StatusCode::ACCEPTED, Json(created)).into_response())
}

async fn task_counts(State(manager): State<TaskManager>) -> Response {
    Json(manager.task_counts()).into_response()
}

async fn get_task(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    Ok(Json(manager.get_task(&id)?).into_response())
}

async fn cancel_task(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let outcome = manager.cancel_task(&id)?;
    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

async fn withdraw_task(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    Ok(Json(manager.withdraw_task(&id)?).into_response())
}

async fn task_progress(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let events = manager.subscribe(&id)?.filter_map(|record| async move {
        match Event::default().event("progress").json_data(&record) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(
                    task_id = %record.task_id,
                    error = %e,
                    "dropping unserializable progress event"
                );
                None
            }
        }
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

async fn get_settings(State(manager): State<TaskManager>) -> Response {
    Json(Settings {
        max_parallel_tasks: manager.max_parallel_tasks().await,
    })
    .into_response()
}

async fn put_settings(
    State(manager): State<TaskManager>,
    Json(settings): Json<Settings>,
) -> Result<Response, AppError> {
    manager
        .set_max_parallel_tasks(settings.max_parallel_tasks)
        .await?;
    Ok(Json(Settings {
        max_parallel_tasks: manager.max_parallel_tasks().await,
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
