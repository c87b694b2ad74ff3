use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of an apply attempt. One row is written per attempt and never
/// mutated afterwards — the application log is append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationStatus {
    #[serde(rename = "accepted")]
    Accepted,
    #[serde(rename = "rejected-duplicate")]
    RejectedDuplicate,
    #[serde(rename = "rejected-capped")]
    RejectedCapped,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::RejectedDuplicate => "rejected-duplicate",
            ApplicationStatus::RejectedCapped => "rejected-capped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(ApplicationStatus::Accepted),
            "rejected-duplicate" => Some(ApplicationStatus::RejectedDuplicate),
            "rejected-capped" => Some(ApplicationStatus::RejectedCapped),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub fingerprint: String,
    pub status: ApplicationStatus,
    /// Set when the application was accepted inside the soft-warn band so
    /// the operator can see which accepts landed near exhaustion.
    pub flagged_warn: bool,
    pub quota_epoch: i64,
    pub cv_ref: String,
    pub submitted_at: DateTime<Utc>,
}
