use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::admission::QuotaState;
use crate::errors::AppError;
use crate::ledger::{JobPatch, NewJob};
use crate::models::batch::BatchState;
use crate::models::job::{JobRow, JobStatus};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub quota_limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: JobRow,
    pub quota_state: QuotaState,
    pub quota_percent: i64,
}

impl JobResponse {
    fn from_row(job: JobRow) -> Self {
        let quota_state = QuotaState::derive(job.total_accepted, job.quota_limit);
        let quota_percent = if job.quota_limit > 0 {
            (job.total_accepted * 100 / job.quota_limit).min(100)
        } else {
            100
        };
        Self {
            job,
            quota_state,
            quota_percent,
        }
    }
}

/// POST /api/v1/jobs
pub async fn handle_create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), AppError> {
    if req.title.trim().is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }
    if req.description.trim().is_empty() {
        return Err(AppError::Validation(
            "description must not be empty".to_string(),
        ));
    }
    let quota_limit = req.quota_limit.unwrap_or(state.config.default_quota_limit);
    if quota_limit < 1 {
        return Err(AppError::Validation(
            "quota_limit must be at least 1".to_string(),
        ));
    }

    let job = state
        .ledger
        .create_job(NewJob {
            owner_id: req.owner_id,
            title: req.title,
            description: req.description,
            quota_limit,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(JobResponse::from_row(job))))
}

/// GET /api/v1/jobs/:id
pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state.ledger.job(job_id).await?;
    Ok(Json(JobResponse::from_row(job)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateJobRequest {
    pub owner_id: Uuid,
    pub quota_limit: Option<i64>,
    pub status: Option<JobStatus>,
}

/// PATCH /api/v1/jobs/:id
///
/// Owner-only. Raising `quota_limit` on a capped job reopens admission
/// according to `READMIT_AFTER_LIMIT_RAISE`.
pub async fn handle_update_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(req): Json<UpdateJobRequest>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state.ledger.job(job_id).await?;
    if job.owner_id != req.owner_id {
        return Err(AppError::Forbidden);
    }
    if let Some(limit) = req.quota_limit {
        if limit < 1 {
            return Err(AppError::Validation(
                "quota_limit must be at least 1".to_string(),
            ));
        }
    }

    let updated = state
        .ledger
        .update_job(
            job_id,
            JobPatch {
                quota_limit: req.quota_limit,
                status: req.status,
            },
        )
        .await?;
    state.feed.quota_changed(
        job_id,
        updated.total_accepted,
        updated.quota_limit,
        QuotaState::derive(updated.total_accepted, updated.quota_limit),
    );
    Ok(Json(JobResponse::from_row(updated)))
}

#[derive(Debug, Deserialize)]
pub struct OwnerRequest {
    pub owner_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub quota_epoch: i64,
}

/// POST /api/v1/jobs/:id/quota/reset
///
/// Owner-only administrative reset. Zeroes the acceptance counter, starts
/// a new epoch, and auto-triggers screening of whatever was collecting.
pub async fn handle_reset_quota(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(req): Json<OwnerRequest>,
) -> Result<Json<ResetResponse>, AppError> {
    let job = state.ledger.job(job_id).await?;
    if job.owner_id != req.owner_id {
        return Err(AppError::Forbidden);
    }

    let quota_epoch = state.ledger.reset(job_id).await?;
    state
        .feed
        .quota_changed(job_id, 0, job.quota_limit, QuotaState::Open);
    state.coordinator.quota_reset(job_id, quota_epoch);
    Ok(Json(ResetResponse { quota_epoch }))
}

/// POST /api/v1/jobs/:id/screen
///
/// Owner-only manual screening trigger: closes and dispatches the
/// collecting batch without waiting for it to fill.
pub async fn handle_trigger_screening(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(req): Json<OwnerRequest>,
) -> Result<StatusCode, AppError> {
    let job = state.ledger.job(job_id).await?;
    if job.owner_id != req.owner_id {
        return Err(AppError::Forbidden);
    }
    state.coordinator.trigger_screening(job_id);
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub state: BatchState,
    pub size: usize,
    pub attempts: i32,
    pub quota_epoch: i64,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub job_id: Uuid,
    pub title: String,
    pub status: JobStatus,
    pub quota_limit: i64,
    pub total_accepted: i64,
    pub quota_epoch: i64,
    pub quota_state: QuotaState,
    pub quota_percent: i64,
    pub batches: Vec<BatchSummary>,
}

/// GET /api/v1/jobs/:id/dashboard
///
/// Polling snapshot for the operator UI: quota position plus batch states.
/// The broadcast feed carries the same data push-style for in-process
/// consumers.
pub async fn handle_dashboard(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<DashboardResponse>, AppError> {
    let job = state.ledger.job(job_id).await?;
    let batches = state
        .batches
        .batches_for_job(job_id)
        .await?
        .into_iter()
        .map(|b| BatchSummary {
            batch_id: b.id,
            state: b.state,
            size: b.application_ids.len(),
            attempts: b.attempts,
            quota_epoch: b.quota_epoch,
        })
        .collect();

    let quota_state = QuotaState::derive(job.total_accepted, job.quota_limit);
    let quota_percent = if job.quota_limit > 0 {
        (job.total_accepted * 100 / job.quota_limit).min(100)
    } else {
        100
    };
    Ok(Json(DashboardResponse {
        job_id: job.id,
        title: job.title,
        status: job.status,
        quota_limit: job.quota_limit,
        total_accepted: job.total_accepted,
        quota_epoch: job.quota_epoch,
        quota_state,
        quota_percent,
        batches,
    }))
}
