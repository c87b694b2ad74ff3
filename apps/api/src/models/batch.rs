use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Screening batch lifecycle.
///
/// `collecting → dispatched → completed` on the happy path. A dispatch
/// failure moves the batch to `failed`; the coordinator re-dispatches it
/// exactly once, after which `failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Collecting,
    Dispatched,
    Completed,
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Collecting => "collecting",
            BatchState::Dispatched => "dispatched",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collecting" => Some(BatchState::Collecting),
            "dispatched" => Some(BatchState::Dispatched),
            "completed" => Some(BatchState::Completed),
            "failed" => Some(BatchState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningBatchRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub quota_epoch: i64,
    pub application_ids: Vec<Uuid>,
    pub state: BatchState,
    /// Dispatch attempts consumed (0 while collecting, at most 2).
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}
