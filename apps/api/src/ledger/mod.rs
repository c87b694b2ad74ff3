//! Quota Ledger — durable, race-safe counters per (job, fingerprint) and
//! per job total.
//!
//! `try_admit` is the system's single-writer bottleneck: the duplicate
//! check, the ceiling check, the counter increments, and the append-only
//! Application row all happen inside one atomic region per job. A naive
//! read-then-write would let two concurrent requests both observe
//! `total_accepted = quota_limit - 1` and overshoot the cap; both backends
//! serialize instead (row lock in Postgres, per-job mutex in memory), so at
//! most `quota_limit` accepts are ever granted per epoch.
//!
//! A request the store cannot safely evaluate fails closed: callers get
//! `StoreError::Unavailable` (surfaced as a retryable transient error),
//! never a silent accept.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::admission::QuotaState;
use crate::identity::ApplicantFingerprint;
use crate::models::application::ApplicationRow;
use crate::models::job::{JobRow, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Behavior knobs shared by both ledger backends.
#[derive(Debug, Clone, Copy)]
pub struct LedgerPolicy {
    /// When true, raising `quota_limit` on a job that already hit the hard
    /// cap reopens admission without a reset. When false, a job that
    /// reached HARD_CLOSED stays closed until an explicit reset.
    pub readmit_after_limit_raise: bool,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            readmit_after_limit_raise: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub quota_limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub quota_limit: Option<i64>,
    pub status: Option<JobStatus>,
}

/// Result of one atomic admission attempt.
#[derive(Debug, Clone)]
pub enum AdmissionRecord {
    Accepted {
        application_id: Uuid,
        attempt_count: i64,
        total_accepted: i64,
        quota_limit: i64,
        quota_epoch: i64,
        flagged_warn: bool,
    },
    Duplicate {
        application_id: Uuid,
        attempt_count: i64,
        total_accepted: i64,
        quota_limit: i64,
    },
    Capped {
        application_id: Uuid,
        total_accepted: i64,
        quota_limit: i64,
    },
}

#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn create_job(&self, new: NewJob) -> Result<JobRow, StoreError>;

    async fn job(&self, job_id: Uuid) -> Result<JobRow, StoreError>;

    /// Applies `quota_limit` / `status` changes. The only mutations a job
    /// row admits outside the ledger-owned counters.
    async fn update_job(&self, job_id: Uuid, patch: JobPatch) -> Result<JobRow, StoreError>;

    /// The atomic check-and-increment. Exactly one of the three
    /// `AdmissionRecord` variants is returned and the corresponding
    /// Application row is written within the same atomic region.
    async fn try_admit(
        &self,
        job_id: Uuid,
        fingerprint: &ApplicantFingerprint,
        cv_ref: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<AdmissionRecord, StoreError>;

    /// Administrative reset: zeroes `total_accepted` and bumps the epoch.
    /// Per-fingerprint attempt counters are retained across resets.
    async fn reset(&self, job_id: Uuid) -> Result<i64, StoreError>;

    /// Append-only application log for a job, oldest first.
    async fn applications(&self, job_id: Uuid) -> Result<Vec<ApplicationRow>, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Shared decision core
// ────────────────────────────────────────────────────────────────────────────

/// Snapshot of the state both backends gather under their per-job lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AdmitInputs {
    pub status: JobStatus,
    pub quota_limit: i64,
    pub total_accepted: i64,
    /// True once the job has hit the hard cap within the current epoch.
    pub capped_in_epoch: bool,
    /// An accepted application with this fingerprint already exists in the
    /// current epoch.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdmitVerdict {
    Accept {
        flagged_warn: bool,
        /// This accept fills the quota; the backend records the epoch as
        /// capped.
        caps_job: bool,
    },
    Duplicate,
    Capped {
        /// The cap was consulted and found exhausted; the backend records
        /// the epoch as capped.
        mark_capped: bool,
    },
}

/// The decision sequence both backends share. Order matters: closed jobs
/// reject first, then the duplicate check (which must not consume a quota
/// slot), then the cap.
pub(crate) fn evaluate(inputs: AdmitInputs, policy: LedgerPolicy) -> AdmitVerdict {
    if inputs.status == JobStatus::Closed {
        return AdmitVerdict::Capped { mark_capped: false };
    }
    if inputs.duplicate {
        return AdmitVerdict::Duplicate;
    }
    if !policy.readmit_after_limit_raise && inputs.capped_in_epoch {
        return AdmitVerdict::Capped { mark_capped: false };
    }
    if inputs.total_accepted >= inputs.quota_limit {
        return AdmitVerdict::Capped { mark_capped: true };
    }
    let total_after = inputs.total_accepted + 1;
    AdmitVerdict::Accept {
        flagged_warn: QuotaState::derive(total_after, inputs.quota_limit) != QuotaState::Open,
        caps_job: total_after >= inputs.quota_limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(total: i64, limit: i64) -> AdmitInputs {
        AdmitInputs {
            status: JobStatus::Active,
            quota_limit: limit,
            total_accepted: total,
            capped_in_epoch: false,
            duplicate: false,
        }
    }

    const READMIT: LedgerPolicy = LedgerPolicy {
        readmit_after_limit_raise: true,
    };
    const STICKY: LedgerPolicy = LedgerPolicy {
        readmit_after_limit_raise: false,
    };

    #[test]
    fn accepts_below_cap() {
        assert_eq!(
            evaluate(inputs(0, 10), READMIT),
            AdmitVerdict::Accept {
                flagged_warn: false,
                caps_job: false
            }
        );
    }

    #[test]
    fn duplicate_wins_over_cap() {
        let mut i = inputs(10, 10);
        i.duplicate = true;
        assert_eq!(evaluate(i, READMIT), AdmitVerdict::Duplicate);
    }

    #[test]
    fn closed_job_rejects_as_capped() {
        let mut i = inputs(0, 10);
        i.status = JobStatus::Closed;
        assert_eq!(
            evaluate(i, READMIT),
            AdmitVerdict::Capped { mark_capped: false }
        );
    }

    #[test]
    fn full_quota_rejects_and_marks_epoch() {
        assert_eq!(
            evaluate(inputs(10, 10), READMIT),
            AdmitVerdict::Capped { mark_capped: true }
        );
    }

    #[test]
    fn accept_into_soft_warn_band_is_flagged() {
        assert_eq!(
            evaluate(inputs(7, 10), READMIT),
            AdmitVerdict::Accept {
                flagged_warn: true, // 8/10 = 80%
                caps_job: false
            }
        );
    }

    #[test]
    fn final_slot_caps_the_job() {
        assert_eq!(
            evaluate(inputs(9, 10), READMIT),
            AdmitVerdict::Accept {
                flagged_warn: true,
                caps_job: true
            }
        );
    }

    #[test]
    fn limit_raise_reopens_by_default() {
        let mut i = inputs(10, 20); // limit raised after capping at 10
        i.capped_in_epoch = true;
        assert!(matches!(evaluate(i, READMIT), AdmitVerdict::Accept { .. }));
    }

    #[test]
    fn sticky_policy_keeps_capped_job_closed_after_raise() {
        let mut i = inputs(10, 20);
        i.capped_in_epoch = true;
        assert_eq!(
            evaluate(i, STICKY),
            AdmitVerdict::Capped { mark_capped: false }
        );
    }
}
