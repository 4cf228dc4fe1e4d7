//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::state::AppState;
use crate::config::NotifierConfig;
use crate::scheduler::JobConfig;
use crate::storage::HistoryFilter;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/jobs", get(list_jobs).post(upsert_job))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/scheduler/start", post(start_scheduler))
        .route("/scheduler/stop", post(stop_scheduler))
        .route("/preview", get(preview))
        .route("/history", get(history))
        .route("/stats", get(stats))
        .route("/notifier", put(update_notifier).get(get_notifier))
        .route("/notifier/history", delete(clear_notifier_history))
        .route("/test", post(test_request))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta() }))
}

/// Error body in the same envelope as successful responses.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        warn!(error = %err, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "data": null,
            "error": { "message": self.message },
            "meta": meta()
        });
        (self.status, Json(body)).into_response()
    }
}

async fn health() -> Json<Value> {
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    envelope(state.app.status())
}

async fn list_jobs(State(state): State<AppState>) -> Json<Value> {
    let jobs = state.app.config().schedules;
    let total = jobs.len();
    Json(json!({ "data": jobs, "meta": { "total": total } }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .app
        .job_status(&id)
        .map(envelope)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown job: {}", id)))
}

async fn upsert_job(
    State(state): State<AppState>,
    Json(job): Json<JobConfig>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = job.id.clone();
    state
        .app
        .add_or_update_job(job)
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    info!(job_id = %id, "job saved via API");
    Ok((StatusCode::CREATED, envelope(state.app.job_status(&id))))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.app.remove_job(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, format!("unknown job: {}", id)))
    }
}

async fn start_scheduler(State(state): State<AppState>) -> Json<Value> {
    state.app.start();
    envelope(json!({ "scheduler_running": true }))
}

async fn stop_scheduler(State(state): State<AppState>) -> Json<Value> {
    state.app.stop().await;
    envelope(json!({ "scheduler_running": false }))
}

#[derive(Debug, Deserialize)]
struct PreviewParams {
    #[serde(default = "default_preview_hours")]
    hours: u32,
}

fn default_preview_hours() -> u32 {
    24
}

async fn preview(State(state): State<AppState>, Query(params): Query<PreviewParams>) -> Json<Value> {
    let upcoming = state.app.preview(params.hours);
    Json(json!({ "data": { "upcoming": upcoming }, "meta": { "hours": params.hours } }))
}

async fn history(
    State(state): State<AppState>,
    Query(filter): Query<HistoryFilter>,
) -> Result<Json<Value>, ApiError> {
    let records = state.app.history(filter).await.map_err(ApiError::internal)?;
    let total = records.len();
    Ok(Json(json!({ "data": records, "meta": { "total": total } })))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let statistics = state.app.statistics().await.map_err(ApiError::internal)?;
    Ok(envelope(statistics))
}

async fn get_notifier(State(state): State<AppState>) -> Json<Value> {
    envelope(state.app.notifier_config())
}

async fn update_notifier(
    State(state): State<AppState>,
    Json(config): Json<NotifierConfig>,
) -> Json<Value> {
    state.app.update_notifier_config(config);
    envelope(state.app.notifier_config())
}

#[derive(Debug, Deserialize)]
struct ClearParams {
    job_id: Option<String>,
}

/// Forget stored hashes and open failure keys, for one job or all of them.
async fn clear_notifier_history(
    State(state): State<AppState>,
    Query(params): Query<ClearParams>,
) -> Json<Value> {
    state.app.clear_notification_history(params.job_id.as_deref());
    envelope(state.app.notifier_statistics())
}

#[derive(Debug, Deserialize)]
struct TestParams {
    job_id: Option<String>,
}

async fn test_request(
    State(state): State<AppState>,
    Query(params): Query<TestParams>,
) -> Result<Json<Value>, ApiError> {
    state
        .app
        .test_request(params.job_id.as_deref())
        .await
        .map(envelope)
        .map_err(|e| ApiError::new(StatusCode::NOT_FOUND, e.to_string()))
}
