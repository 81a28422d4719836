//! Route handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::AppState;
use crate::core::{SchedulerStats, SubscriptionKind};
use crate::domain::TaskId;

/// Interval between SSE keep-alive comments
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// JSON error body returned with 4xx responses
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// Submission request body
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub task_description: String,
}

/// Submission acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    pub task_id: TaskId,
}

/// Queue a task and return its id
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let task_id = state
        .gateway
        .submit(&request.task_description)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    Ok(Json(SubmitResponse {
        status: "queued".to_string(),
        task_id,
    }))
}

/// Stream a task's events as server-sent events
pub async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let task_id: TaskId = task_id
        .parse()
        .map_err(|_| ApiError::not_found(format!("Unknown task: {}", task_id)))?;

    let subscription = state.gateway.stream(task_id);
    if subscription.kind() == SubscriptionKind::Unknown {
        return Err(ApiError::not_found(format!("Unknown task: {}", task_id)));
    }

    debug!(task_id = %subscription.task_id(), kind = ?subscription.kind(), "Opening event stream");

    let events = subscription.into_stream().filter_map(move |event| async move {
        match Event::default().json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!(%task_id, error = %e, "Dropping unserializable event");
                None
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

/// Health probe body
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pending: usize,
    pub batches: u64,
    pub processed: u64,
    pub aborted: u64,
}

impl From<SchedulerStats> for HealthResponse {
    fn from(stats: SchedulerStats) -> Self {
        Self {
            status: "ok".to_string(),
            pending: stats.pending,
            batches: stats.batches,
            processed: stats.processed,
            aborted: stats.aborted,
        }
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.gateway.stats().into())
}
