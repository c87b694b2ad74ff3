//! Ranking Store — persists scoring results and exposes the ranked view.
//!
//! Upserts are idempotent by `application_id`. Ordering is score
//! descending with ties broken by earlier submission, so promptness is
//! rewarded deterministically. Rank is derived at query time, never stored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::ledger::StoreError;
use crate::models::ranking::RankingEntryRow;

#[derive(Debug, Clone)]
pub struct NewRankingEntry {
    pub application_id: Uuid,
    pub job_id: Uuid,
    pub score: i32,
    pub reasoning: String,
    pub quota_epoch: i64,
    pub submitted_at: DateTime<Utc>,
}

/// One row of the ranked view returned to operators.
#[derive(Debug, Clone, Serialize)]
pub struct RankedEntry {
    pub rank: u32,
    pub application_id: Uuid,
    pub score: i32,
    pub reasoning: String,
    pub submitted_at: DateTime<Utc>,
}

#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Idempotent upsert by `application_id`.
    async fn upsert_entries(&self, entries: &[NewRankingEntry]) -> Result<(), StoreError>;

    /// Marks entries from epochs before `epoch` as superseded. They stay
    /// queryable as history but drop out of the ranked view.
    async fn supersede_before_epoch(&self, job_id: Uuid, epoch: i64) -> Result<u64, StoreError>;

    /// Current (non-superseded) entries for a job, ranked.
    async fn ranked_for_job(&self, job_id: Uuid) -> Result<Vec<RankedEntry>, StoreError>;
}

/// Shared ordering rule for both backends: score descending, earlier
/// submission first on ties, with 1-based ranks assigned positionally.
pub fn rank_entries(mut rows: Vec<RankingEntryRow>) -> Vec<RankedEntry> {
    rows.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.submitted_at.cmp(&b.submitted_at))
    });
    rows.into_iter()
        .enumerate()
        .map(|(i, row)| RankedEntry {
            rank: i as u32 + 1,
            application_id: row.application_id,
            score: row.score,
            reasoning: row.reasoning,
            submitted_at: row.submitted_at,
        })
        .collect()
}
