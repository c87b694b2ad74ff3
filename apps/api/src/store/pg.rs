//! PostgreSQL store.
//!
//! `try_admit` opens one transaction and takes a row lock on the job
//! (`SELECT … FOR UPDATE`), which serializes the duplicate check, the
//! ceiling check, the counter increments, and the Application insert for
//! that job. Requests for different jobs lock different rows and proceed
//! in parallel. Any sqlx failure maps to `StoreError::Unavailable` — the
//! admission path fails closed rather than guessing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::identity::ApplicantFingerprint;
use crate::ledger::{
    evaluate, AdmitInputs, AdmitVerdict, AdmissionRecord, JobPatch, LedgerPolicy, NewJob,
    QuotaLedger, StoreError,
};
use crate::models::application::{ApplicationRow, ApplicationStatus};
use crate::models::batch::{BatchState, ScreeningBatchRow};
use crate::models::job::{JobRow, JobStatus};
use crate::models::ranking::RankingEntryRow;
use crate::rankings::{rank_entries, NewRankingEntry, RankedEntry, RankingStore};
use crate::screening::batch::BatchMeta;
use crate::screening::BatchStore;

pub struct PgStore {
    pool: PgPool,
    policy: LedgerPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool, policy: LedgerPolicy) -> Self {
        Self { pool, policy }
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[derive(FromRow)]
struct RawJob {
    id: Uuid,
    owner_id: Uuid,
    title: String,
    description: String,
    quota_limit: i64,
    total_accepted: i64,
    quota_epoch: i64,
    capped_in_epoch: bool,
    status: String,
    created_at: DateTime<Utc>,
}

impl RawJob {
    fn into_row(self) -> Result<JobRow, StoreError> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown job status {}", self.status)))?;
        Ok(JobRow {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title,
            description: self.description,
            quota_limit: self.quota_limit,
            total_accepted: self.total_accepted,
            quota_epoch: self.quota_epoch,
            status,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct RawApplication {
    id: Uuid,
    job_id: Uuid,
    fingerprint: String,
    status: String,
    flagged_warn: bool,
    quota_epoch: i64,
    cv_ref: String,
    submitted_at: DateTime<Utc>,
}

impl RawApplication {
    fn into_row(self) -> Result<ApplicationRow, StoreError> {
        let status = ApplicationStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Unavailable(format!("unknown application status {}", self.status))
        })?;
        Ok(ApplicationRow {
            id: self.id,
            job_id: self.job_id,
            fingerprint: self.fingerprint,
            status,
            flagged_warn: self.flagged_warn,
            quota_epoch: self.quota_epoch,
            cv_ref: self.cv_ref,
            submitted_at: self.submitted_at,
        })
    }
}

#[derive(FromRow)]
struct RawBatch {
    id: Uuid,
    job_id: Uuid,
    quota_epoch: i64,
    application_ids: Vec<Uuid>,
    state: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl RawBatch {
    fn into_row(self) -> Result<ScreeningBatchRow, StoreError> {
        let state = BatchState::parse(&self.state).ok_or_else(|| {
            StoreError::Unavailable(format!("unknown batch state {}", self.state))
        })?;
        Ok(ScreeningBatchRow {
            id: self.id,
            job_id: self.job_id,
            quota_epoch: self.quota_epoch,
            application_ids: self.application_ids,
            state,
            attempts: self.attempts,
            created_at: self.created_at,
            closed_at: self.closed_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, owner_id, title, description, quota_limit, total_accepted, \
                           quota_epoch, capped_in_epoch, status, created_at";

async fn insert_application(
    tx: &mut Transaction<'_, Postgres>,
    application: &ApplicationRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO applications
            (id, job_id, fingerprint, status, flagged_warn, quota_epoch, cv_ref, submitted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(application.id)
    .bind(application.job_id)
    .bind(&application.fingerprint)
    .bind(application.status.as_str())
    .bind(application.flagged_warn)
    .bind(application.quota_epoch)
    .bind(&application.cv_ref)
    .bind(application.submitted_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl QuotaLedger for PgStore {
    async fn create_job(&self, new: NewJob) -> Result<JobRow, StoreError> {
        let job = JobRow {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            title: new.title,
            description: new.description,
            quota_limit: new.quota_limit,
            total_accepted: 0,
            quota_epoch: 0,
            status: JobStatus::Active,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, owner_id, title, description, quota_limit, total_accepted,
                 quota_epoch, capped_in_epoch, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, 0, FALSE, $6, $7)
            "#,
        )
        .bind(job.id)
        .bind(job.owner_id)
        .bind(&job.title)
        .bind(&job.description)
        .bind(job.quota_limit)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(job)
    }

    async fn job(&self, job_id: Uuid) -> Result<JobRow, StoreError> {
        let raw: Option<RawJob> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        raw.ok_or(StoreError::JobNotFound(job_id))?.into_row()
    }

    async fn update_job(&self, job_id: Uuid, patch: JobPatch) -> Result<JobRow, StoreError> {
        let raw: Option<RawJob> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs
            SET quota_limit = COALESCE($2, quota_limit),
                status = COALESCE($3, status)
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(patch.quota_limit)
        .bind(patch.status.map(|s| s.as_str()))
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        raw.ok_or(StoreError::JobNotFound(job_id))?.into_row()
    }

    async fn try_admit(
        &self,
        job_id: Uuid,
        fingerprint: &ApplicantFingerprint,
        cv_ref: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<AdmissionRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        // Row lock: every admission for this job serializes here.
        let raw: Option<RawJob> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
        let Some(raw) = raw else {
            return Err(StoreError::JobNotFound(job_id));
        };
        let capped_in_epoch = raw.capped_in_epoch;
        let job = raw.into_row()?;

        let duplicate: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM applications
                WHERE job_id = $1 AND fingerprint = $2 AND quota_epoch = $3
                  AND status = 'accepted'
            )
            "#,
        )
        .bind(job_id)
        .bind(fingerprint.as_str())
        .bind(job.quota_epoch)
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?;

        let verdict = evaluate(
            AdmitInputs {
                status: job.status,
                quota_limit: job.quota_limit,
                total_accepted: job.total_accepted,
                capped_in_epoch,
                duplicate,
            },
            self.policy,
        );

        let attempt_count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO quota_counters (job_id, fingerprint, attempt_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (job_id, fingerprint)
            DO UPDATE SET attempt_count = quota_counters.attempt_count + 1
            RETURNING attempt_count
            "#,
        )
        .bind(job_id)
        .bind(fingerprint.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?;

        let (status, flagged_warn, total_accepted) = match verdict {
            AdmitVerdict::Accept { flagged_warn, caps_job } => {
                let total: i64 = sqlx::query_scalar(
                    r#"
                    UPDATE jobs
                    SET total_accepted = total_accepted + 1,
                        capped_in_epoch = capped_in_epoch OR $2
                    WHERE id = $1
                    RETURNING total_accepted
                    "#,
                )
                .bind(job_id)
                .bind(caps_job)
                .fetch_one(&mut *tx)
                .await
                .map_err(unavailable)?;
                (ApplicationStatus::Accepted, flagged_warn, total)
            }
            AdmitVerdict::Duplicate => {
                (ApplicationStatus::RejectedDuplicate, false, job.total_accepted)
            }
            AdmitVerdict::Capped { mark_capped } => {
                if mark_capped {
                    sqlx::query("UPDATE jobs SET capped_in_epoch = TRUE WHERE id = $1")
                        .bind(job_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(unavailable)?;
                }
                (ApplicationStatus::RejectedCapped, false, job.total_accepted)
            }
        };

        let application = ApplicationRow {
            id: Uuid::new_v4(),
            job_id,
            fingerprint: fingerprint.as_str().to_string(),
            status,
            flagged_warn,
            quota_epoch: job.quota_epoch,
            cv_ref: cv_ref.to_string(),
            submitted_at,
        };
        insert_application(&mut tx, &application)
            .await
            .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;

        Ok(match status {
            ApplicationStatus::Accepted => AdmissionRecord::Accepted {
                application_id: application.id,
                attempt_count,
                total_accepted,
                quota_limit: job.quota_limit,
                quota_epoch: job.quota_epoch,
                flagged_warn,
            },
            ApplicationStatus::RejectedDuplicate => AdmissionRecord::Duplicate {
                application_id: application.id,
                attempt_count,
                total_accepted,
                quota_limit: job.quota_limit,
            },
            ApplicationStatus::RejectedCapped => AdmissionRecord::Capped {
                application_id: application.id,
                total_accepted,
                quota_limit: job.quota_limit,
            },
        })
    }

    async fn reset(&self, job_id: Uuid) -> Result<i64, StoreError> {
        let epoch: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET total_accepted = 0,
                quota_epoch = quota_epoch + 1,
                capped_in_epoch = FALSE
            WHERE id = $1
            RETURNING quota_epoch
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        epoch.ok_or(StoreError::JobNotFound(job_id))
    }

    async fn applications(&self, job_id: Uuid) -> Result<Vec<ApplicationRow>, StoreError> {
        let raws: Vec<RawApplication> = sqlx::query_as(
            r#"
            SELECT id, job_id, fingerprint, status, flagged_warn, quota_epoch, cv_ref, submitted_at
            FROM applications
            WHERE job_id = $1
            ORDER BY submitted_at
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        raws.into_iter().map(RawApplication::into_row).collect()
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn insert_batch(&self, meta: &BatchMeta) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO screening_batches
                (id, job_id, quota_epoch, application_ids, state, attempts, created_at)
            VALUES ($1, $2, $3, '{}', 'collecting', 0, $4)
            "#,
        )
        .bind(meta.batch_id)
        .bind(meta.job_id)
        .bind(meta.quota_epoch)
        .bind(meta.created_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn append_application(
        &self,
        batch_id: Uuid,
        application_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE screening_batches
            SET application_ids = array_append(application_ids, $2)
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(application_id)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn mark_dispatched(&self, batch_id: Uuid, attempts: i32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE screening_batches
            SET state = 'dispatched',
                attempts = $2,
                closed_at = COALESCE(closed_at, NOW())
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(attempts)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn mark_completed(&self, batch_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE screening_batches SET state = 'completed' WHERE id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn mark_failed(&self, batch_id: Uuid, attempts: i32) -> Result<(), StoreError> {
        sqlx::query("UPDATE screening_batches SET state = 'failed', attempts = $2 WHERE id = $1")
            .bind(batch_id)
            .bind(attempts)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn batches_for_job(&self, job_id: Uuid) -> Result<Vec<ScreeningBatchRow>, StoreError> {
        let raws: Vec<RawBatch> = sqlx::query_as(
            r#"
            SELECT id, job_id, quota_epoch, application_ids, state, attempts, created_at, closed_at
            FROM screening_batches
            WHERE job_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        raws.into_iter().map(RawBatch::into_row).collect()
    }
}

#[async_trait]
impl RankingStore for PgStore {
    async fn upsert_entries(&self, entries: &[NewRankingEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO ranking_entries
                    (application_id, job_id, score, reasoning, quota_epoch,
                     superseded, submitted_at, created_at)
                VALUES ($1, $2, $3, $4, $5, FALSE, $6, NOW())
                ON CONFLICT (application_id) DO UPDATE
                SET score = EXCLUDED.score,
                    reasoning = EXCLUDED.reasoning,
                    quota_epoch = EXCLUDED.quota_epoch,
                    superseded = FALSE,
                    submitted_at = EXCLUDED.submitted_at
                "#,
            )
            .bind(entry.application_id)
            .bind(entry.job_id)
            .bind(entry.score)
            .bind(&entry.reasoning)
            .bind(entry.quota_epoch)
            .bind(entry.submitted_at)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn supersede_before_epoch(&self, job_id: Uuid, epoch: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ranking_entries
            SET superseded = TRUE
            WHERE job_id = $1 AND quota_epoch < $2 AND NOT superseded
            "#,
        )
        .bind(job_id)
        .bind(epoch)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(result.rows_affected())
    }

    async fn ranked_for_job(&self, job_id: Uuid) -> Result<Vec<RankedEntry>, StoreError> {
        let rows: Vec<RankingEntryRow> = sqlx::query_as::<_, RawRanking>(
            r#"
            SELECT application_id, job_id, score, reasoning, quota_epoch,
                   superseded, submitted_at, created_at
            FROM ranking_entries
            WHERE job_id = $1 AND NOT superseded
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?
        .into_iter()
        .map(RawRanking::into_row)
        .collect();
        Ok(rank_entries(rows))
    }
}

#[derive(FromRow)]
struct RawRanking {
    application_id: Uuid,
    job_id: Uuid,
    score: i32,
    reasoning: String,
    quota_epoch: i64,
    superseded: bool,
    submitted_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl RawRanking {
    fn into_row(self) -> RankingEntryRow {
        RankingEntryRow {
            application_id: self.application_id,
            job_id: self.job_id,
            score: self.score,
            reasoning: self.reasoning,
            quota_epoch: self.quota_epoch,
            superseded: self.superseded,
            submitted_at: self.submitted_at,
            created_at: self.created_at,
        }
    }
}
