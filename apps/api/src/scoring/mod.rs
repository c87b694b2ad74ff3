//! Resume scoring — the narrow contract to the external scoring capability.
//!
//! Default backend: `LlmResumeScorer` (Claude, through `llm_client`).
//! Tests swap in scripted fakes without touching the coordinator or the
//! admission path. Carried in the coordinator as `Arc<dyn ResumeScorer>`.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::llm_client::{LlmClient, LlmError};
use crate::llm_client::prompts::{screening_prompt, SCREENING_SYSTEM};
use crate::screening::batch::BatchApplication;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("scoring call timed out")]
    Timeout,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("invalid scoring response: {0}")]
    Invalid(String),
}

/// Job context handed to the scorer alongside the batch.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub title: String,
    pub description: String,
}

/// One scored application, as returned by the capability.
#[derive(Debug, Clone)]
pub struct ScoredApplication {
    pub application_id: Uuid,
    /// Clamped into [0, 100] at this seam.
    pub score: i32,
    pub reasoning: String,
}

/// The scoring capability contract: one batch in, a ranked list out.
/// Billed per call — callers own the retry budget, implementations must
/// not retry a scoring attempt on their own.
#[async_trait]
pub trait ResumeScorer: Send + Sync {
    async fn score_batch(
        &self,
        job: &JobContext,
        applications: &[BatchApplication],
    ) -> Result<Vec<ScoredApplication>, ScoringError>;
}

// ────────────────────────────────────────────────────────────────────────────
// LLM-backed scorer
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawScore {
    application_id: Uuid,
    score: i64,
    reasoning: String,
}

pub struct LlmResumeScorer {
    llm: LlmClient,
}

impl LlmResumeScorer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ResumeScorer for LlmResumeScorer {
    async fn score_batch(
        &self,
        job: &JobContext,
        applications: &[BatchApplication],
    ) -> Result<Vec<ScoredApplication>, ScoringError> {
        if applications.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            job_id = %job.job_id,
            batch_size = applications.len(),
            "submitting screening batch to the scoring capability"
        );
        let prompt = screening_prompt(&job.title, &job.description, applications);
        let raw: Vec<RawScore> = self.llm.call_json(&prompt, SCREENING_SYSTEM).await?;

        if raw.is_empty() {
            return Err(ScoringError::Invalid(
                "scoring capability returned an empty list".to_string(),
            ));
        }

        let known: std::collections::HashSet<Uuid> =
            applications.iter().map(|a| a.application_id).collect();

        let mut scored = Vec::with_capacity(raw.len());
        for entry in raw {
            if !known.contains(&entry.application_id) {
                warn!(
                    application_id = %entry.application_id,
                    "scoring response references an application outside the batch; dropping"
                );
                continue;
            }
            scored.push(ScoredApplication {
                application_id: entry.application_id,
                score: entry.score.clamp(0, 100) as i32,
                reasoning: entry.reasoning,
            });
        }

        if scored.is_empty() {
            return Err(ScoringError::Invalid(
                "no scoring entry matched the submitted batch".to_string(),
            ));
        }
        Ok(scored)
    }
}
