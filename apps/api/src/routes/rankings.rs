use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::rankings::RankedEntry;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RankingsResponse {
    pub job_id: Uuid,
    pub entries: Vec<RankedEntry>,
}

/// GET /api/v1/jobs/:id/rankings
///
/// The ranked candidate list: score descending, ties broken by earlier
/// submission. Entries superseded by a post-reset rescreen are excluded.
pub async fn handle_rankings(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<RankingsResponse>, AppError> {
    // 404 for unknown jobs rather than an empty list.
    let job = state.ledger.job(job_id).await?;
    let entries = state.rankings.ranked_for_job(job.id).await?;
    Ok(Json(RankingsResponse {
        job_id: job.id,
        entries,
    }))
}
