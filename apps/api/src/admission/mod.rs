//! Admission Engine — decides accept / soft-warn / reject for each apply
//! attempt.
//!
//! The quota state is a pure derivation over `(total_accepted, quota_limit)`
//! recomputed on every decision. Nothing here is persisted as a separate
//! state field, so the engine cannot drift out of sync with the ledger.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::feed::DashboardFeed;
use crate::identity::{FingerprintResolver, RequestSignals};
use crate::ledger::{AdmissionRecord, QuotaLedger, StoreError};
use crate::models::application::ApplicationStatus;
use crate::screening::batch::BatchApplication;
use crate::screening::coordinator::CoordinatorHandle;

/// Percentage of `quota_limit` at which accepted applications start carrying
/// an operator-facing warning.
pub const SOFT_WARN_PERCENT: i64 = 80;

/// Derived per-job quota state. `OPEN → SOFT_WARN → HARD_CLOSED` is
/// monotonic within an epoch; a reset returns the job to `OPEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaState {
    Open,
    SoftWarn,
    HardClosed,
}

impl QuotaState {
    /// Pure derivation: OPEN below 80%, SOFT_WARN in [80%, 100%),
    /// HARD_CLOSED at or above 100%. Integer arithmetic only.
    pub fn derive(total_accepted: i64, quota_limit: i64) -> Self {
        if quota_limit <= 0 || total_accepted >= quota_limit {
            return QuotaState::HardClosed;
        }
        if total_accepted * 100 >= quota_limit * SOFT_WARN_PERCENT {
            return QuotaState::SoftWarn;
        }
        QuotaState::Open
    }
}

impl std::fmt::Display for QuotaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QuotaState::Open => "open",
            QuotaState::SoftWarn => "soft_warn",
            QuotaState::HardClosed => "hard_closed",
        };
        f.write_str(s)
    }
}

/// Caller-visible outcome of one apply attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub application_id: Uuid,
    pub status: ApplicationStatus,
    #[serde(skip)]
    pub quota_state: QuotaState,
    #[serde(skip)]
    pub flagged_warn: bool,
}

/// Orchestrates one admission: fingerprint → atomic ledger decision → feed
/// event → batch hand-off. Holds only shared handles, so it is cheap to
/// clone into the request path.
#[derive(Clone)]
pub struct AdmissionEngine {
    ledger: Arc<dyn QuotaLedger>,
    feed: DashboardFeed,
    coordinator: CoordinatorHandle,
    resolver: FingerprintResolver,
}

impl AdmissionEngine {
    pub fn new(
        ledger: Arc<dyn QuotaLedger>,
        feed: DashboardFeed,
        coordinator: CoordinatorHandle,
        resolver: FingerprintResolver,
    ) -> Self {
        Self {
            ledger,
            feed,
            coordinator,
            resolver,
        }
    }

    /// Decides one apply attempt. The ledger call is the single atomic
    /// check-and-increment; everything after it runs without any lock held.
    pub async fn decide(
        &self,
        job_id: Uuid,
        signals: &RequestSignals,
        cv_ref: &str,
    ) -> Result<AdmissionDecision, StoreError> {
        let submitted_at = Utc::now();
        let fingerprint = self.resolver.resolve(signals, submitted_at);

        let record = self
            .ledger
            .try_admit(job_id, &fingerprint, cv_ref, submitted_at)
            .await?;

        let decision = match record {
            AdmissionRecord::Accepted {
                application_id,
                total_accepted,
                quota_limit,
                quota_epoch,
                flagged_warn,
                ..
            } => {
                let state = QuotaState::derive(total_accepted, quota_limit);
                self.feed
                    .quota_changed(job_id, total_accepted, quota_limit, state);
                self.coordinator.application_accepted(
                    job_id,
                    quota_epoch,
                    BatchApplication {
                        application_id,
                        cv_ref: cv_ref.to_string(),
                        submitted_at,
                    },
                );
                AdmissionDecision {
                    application_id,
                    status: ApplicationStatus::Accepted,
                    quota_state: state,
                    flagged_warn,
                }
            }
            AdmissionRecord::Duplicate {
                application_id,
                total_accepted,
                quota_limit,
                ..
            } => {
                let state = QuotaState::derive(total_accepted, quota_limit);
                self.feed
                    .quota_changed(job_id, total_accepted, quota_limit, state);
                AdmissionDecision {
                    application_id,
                    status: ApplicationStatus::RejectedDuplicate,
                    quota_state: state,
                    flagged_warn: false,
                }
            }
            AdmissionRecord::Capped {
                application_id,
                total_accepted,
                quota_limit,
            } => {
                self.feed.quota_changed(
                    job_id,
                    total_accepted,
                    quota_limit,
                    QuotaState::HardClosed,
                );
                AdmissionDecision {
                    application_id,
                    status: ApplicationStatus::RejectedCapped,
                    quota_state: QuotaState::HardClosed,
                    flagged_warn: false,
                }
            }
        };

        debug!(
            %job_id,
            fingerprint = %fingerprint,
            status = %decision.status,
            state = %decision.quota_state,
            flagged_warn = decision.flagged_warn,
            "admission decision"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_thresholds() {
        assert_eq!(QuotaState::derive(0, 200), QuotaState::Open);
        assert_eq!(QuotaState::derive(159, 200), QuotaState::Open);
        assert_eq!(QuotaState::derive(160, 200), QuotaState::SoftWarn);
        assert_eq!(QuotaState::derive(199, 200), QuotaState::SoftWarn);
        assert_eq!(QuotaState::derive(200, 200), QuotaState::HardClosed);
        assert_eq!(QuotaState::derive(250, 200), QuotaState::HardClosed);
    }

    #[test]
    fn derivation_handles_tiny_limits() {
        assert_eq!(QuotaState::derive(0, 1), QuotaState::Open);
        assert_eq!(QuotaState::derive(1, 1), QuotaState::HardClosed);
        // 4/5 = 80% exactly
        assert_eq!(QuotaState::derive(4, 5), QuotaState::SoftWarn);
        assert_eq!(QuotaState::derive(3, 5), QuotaState::Open);
    }

    #[test]
    fn derivation_is_a_pure_function() {
        // Same inputs, same output, regardless of call order or repetition.
        let pairs = [(0, 10), (8, 10), (10, 10), (7, 10), (8, 10)];
        let first: Vec<_> = pairs
            .iter()
            .map(|&(t, l)| QuotaState::derive(t, l))
            .collect();
        let second: Vec<_> = pairs
            .iter()
            .rev()
            .map(|&(t, l)| QuotaState::derive(t, l))
            .collect();
        assert_eq!(first, second.into_iter().rev().collect::<Vec<_>>());
    }

    #[test]
    fn zero_or_negative_limit_is_closed() {
        assert_eq!(QuotaState::derive(0, 0), QuotaState::HardClosed);
        assert_eq!(QuotaState::derive(0, -1), QuotaState::HardClosed);
    }
}
