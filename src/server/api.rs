use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delivery::{ApplyOutcome, ApplyRequest, DeliveryEngine};
use crate::errors::DeliveryError;
use crate::repo::RepoRef;
use crate::safety;
use crate::sandbox::{JobQueue, JobStatus};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub engine: Arc<DeliveryEngine>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub repository: String,
    pub target_file: String,
    pub diff: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewAccepted {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStatus {
    pub job_id: String,
    pub status: JobStatus,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_hash: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

/// Every failure is answered as `{error, reason, details?}`.
pub struct ApiError(DeliveryError);

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(DeliveryError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let details = match &err {
            DeliveryError::UnsafePatch(reason) => Some(reason.clone()),
            DeliveryError::InvalidToken(e) => Some(e.to_string()),
            DeliveryError::Patch(e) | DeliveryError::RebaseConflict { source: e, .. } => {
                Some(e.to_string())
            }
            _ => None,
        };
        let mut body = serde_json::json!({
            "error": err.to_string(),
            "reason": err.reason(),
        });
        if let Some(details) = details {
            body["details"] = serde_json::Value::String(details);
        }
        (err.status(), Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/preview", post(enqueue_preview))
        .route("/api/preview/{job_id}", get(preview_status))
        .route("/api/apply", post(apply_edit))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn enqueue_preview(
    State(state): State<SharedState>,
    payload: Result<Json<PreviewRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;

    for (field, value) in [
        ("repository", &req.repository),
        ("targetFile", &req.target_file),
        ("diff", &req.diff),
    ] {
        if value.trim().is_empty() {
            return Err(DeliveryError::Validation(format!("{} must not be empty", field)).into());
        }
    }
    if RepoRef::parse(&req.repository).is_none() {
        return Err(DeliveryError::Validation(format!(
            "invalid repository locator '{}', expected owner/repo or a GitHub URL",
            req.repository
        ))
        .into());
    }

    let verdict = safety::check(&req.target_file, &req.diff);
    if !verdict.safe {
        let reason = verdict.reason.unwrap_or_default();
        tracing::warn!(repo = %req.repository, file = %req.target_file, %reason, "preview rejected as unsafe");
        return Err(DeliveryError::UnsafePatch(reason).into());
    }

    let job_id = state
        .queue
        .enqueue(&req.repository, &req.target_file, &req.diff);
    Ok((
        StatusCode::ACCEPTED,
        Json(PreviewAccepted {
            job_id,
            status: JobStatus::Queued,
        }),
    ))
}

async fn preview_status(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<PreviewStatus>, ApiError> {
    let job = state
        .queue
        .get_job(&job_id)
        .ok_or(DeliveryError::JobNotFound { job_id })?;

    let succeeded = job.status == JobStatus::Success;
    Ok(Json(PreviewStatus {
        job_id: job.id,
        status: job.status,
        logs: job.logs,
        token: job.token.filter(|_| succeeded),
        expires_at: job.expires_at.filter(|_| succeeded),
        diff_hash: job.diff_hash.filter(|_| succeeded),
    }))
}

async fn apply_edit(
    State(state): State<SharedState>,
    payload: Result<Json<ApplyRequest>, JsonRejection>,
) -> Result<Json<ApplyOutcome>, ApiError> {
    let Json(req) = payload?;
    let outcome = state.engine.apply(&req).await?;
    Ok(Json(outcome))
}
