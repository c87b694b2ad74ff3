use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted scoring result for one application. Immutable once written;
/// a rescreen after a quota reset supersedes earlier entries instead of
/// overwriting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingEntryRow {
    pub application_id: Uuid,
    pub job_id: Uuid,
    /// 0–100, clamped at the scoring seam.
    pub score: i32,
    pub reasoning: String,
    pub quota_epoch: i64,
    pub superseded: bool,
    /// Denormalized from the application for deterministic tie-breaking.
    pub submitted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
