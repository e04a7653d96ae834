//! Route handlers for the batch processor and limiter.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::field::Empty;
use tracing::{debug, info, instrument, Span};

use super::middleware::rate_limit;
use crate::batch::{BatchProcessor, NewTask, ProcessorStats, Task, TaskId};
use crate::error::{PressgateError, Result};
use crate::ratelimit::{RateLimiter, RateLimiterStats};

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub processor: BatchProcessor,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>, processor: BatchProcessor) -> Self {
        Self { limiter, processor }
    }
}

#[derive(Debug, Serialize)]
struct Submitted {
    task_id: TaskId,
}

#[derive(Debug, Serialize)]
struct Cancelled {
    cancelled: bool,
}

/// Build the application router.
///
/// Routes registered before the rate limit layer are limited; `/health` is not.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/batch/tasks", post(submit_task))
        .route("/api/batch/tasks/{id}", get(get_task))
        .route("/api/batch/tasks/{id}/cancel", post(cancel_task))
        .route("/api/batch/owners/{owner}/tasks", get(list_owner_tasks))
        .route("/api/batch/stats", get(processor_stats))
        .route("/api/rate-limit/stats", get(limiter_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .route("/health", get(health))
        .with_state(state)
}

#[instrument(skip_all, fields(kind = Empty, owner = Empty))]
async fn submit_task(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NewTask>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(new_task) = payload?;
    let span = Span::current();
    span.record("kind", new_task.kind.as_str());
    span.record("owner", new_task.owner.as_str());

    let task_id = state.processor.submit(new_task)?;
    info!(task_id = %task_id, "Accepted batch task");
    Ok((StatusCode::ACCEPTED, Json(Submitted { task_id })))
}

#[instrument(skip(state))]
async fn get_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    state
        .processor
        .get_status(id)
        .map(Json)
        .ok_or(PressgateError::TaskNotFound(id))
}

#[instrument(skip(state))]
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> Result<Json<Cancelled>> {
    if state.processor.get_status(id).is_none() {
        return Err(PressgateError::TaskNotFound(id));
    }
    let cancelled = state.processor.cancel(id);
    debug!(task_id = %id, cancelled, "Cancel requested");
    Ok(Json(Cancelled { cancelled }))
}

#[instrument(skip(state))]
async fn list_owner_tasks(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Json<Vec<Task>> {
    Json(state.processor.list_for_owner(&owner))
}

async fn processor_stats(State(state): State<AppState>) -> Json<ProcessorStats> {
    Json(state.processor.stats())
}

async fn limiter_stats(State(state): State<AppState>) -> Json<RateLimiterStats> {
    Json(state.limiter.stats())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
