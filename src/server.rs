// HTTP boundary for task submission
//
// Routes:
// - POST /task          submit a task for a user_id
// - GET  /health        liveness
// - GET  /metrics       Prometheus scrape endpoint
// - GET  /queue         delayed queue statistics
// - GET  /dead-letters  dead letter entries

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::GateError;
use crate::identity::Identity;
use crate::metrics;
use crate::queue::DelayedQueue;
use crate::runtime::Runtime;
use crate::scheduler::{AdmissionScheduler, SubmitOutcome};

pub const TASK_COMPLETED: &str = "Task completed.";
pub const TASK_QUEUED: &str = "Task queued due to rate limit.";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    scheduler: AdmissionScheduler,
    queue: Arc<dyn DelayedQueue>,
}

impl AppState {
    pub fn new(scheduler: AdmissionScheduler, queue: Arc<dyn DelayedQueue>) -> Self {
        Self { scheduler, queue }
    }
}

impl From<&Runtime> for AppState {
    fn from(runtime: &Runtime) -> Self {
        Self::new(runtime.scheduler.clone(), runtime.queue.clone())
    }
}

/// Body returned for an accepted submission
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub status: &'static str,
    pub user_id: Identity,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl From<SubmitOutcome> for SubmitResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Executed(record) => Self {
                status: "executed",
                user_id: record.identity,
                message: TASK_COMPLETED,
                not_before: None,
            },
            SubmitOutcome::Queued(task) => Self {
                status: "queued",
                user_id: task.identity,
                message: TASK_QUEUED,
                not_before: Some(task.not_before),
            },
        }
    }
}

/// Maps core errors onto status codes
pub struct ApiError(GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GateError::InvalidIdentity => StatusCode::BAD_REQUEST,
            GateError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::Execution { .. } | GateError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/task", post(submit_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/queue", get(queue_handler))
        .route("/dead-letters", get(dead_letters_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve `app` on `addr` until `shutdown` resolves
pub async fn serve<F>(app: Router, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    Ok(())
}

/// Task submission handler
///
/// Malformed bodies and missing identities are answered here and never
/// reach the scheduler.
async fn submit_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let identity = match payload {
        Ok(Json(body)) => Identity::from_json(body.get("user_id").unwrap_or(&Value::Null))?,
        Err(rejection) => {
            warn!("Rejected malformed submission: {}", rejection.body_text());
            return Err(GateError::InvalidIdentity.into());
        }
    };

    let outcome = state.scheduler.submit(identity).await.map_err(|e| {
        if e.is_store() {
            error!("Store unavailable, refusing submission: {}", e);
        }
        ApiError(e)
    })?;

    let status = match outcome {
        SubmitOutcome::Executed(_) => StatusCode::OK,
        SubmitOutcome::Queued(_) => StatusCode::ACCEPTED,
    };
    Ok((status, Json(SubmitResponse::from(outcome))).into_response())
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn queue_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stats = state.queue.stats().await?;
    Ok(Json(stats).into_response())
}

async fn dead_letters_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let entries = state.queue.dead_letters().await?;
    Ok(Json(entries).into_response())
}
