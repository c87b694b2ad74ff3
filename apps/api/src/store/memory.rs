//! In-memory store. Backs standalone mode (no `DATABASE_URL`) and every
//! test that needs a ledger without a database.
//!
//! Serialization point: one async mutex per job entry. `try_admit` holds it
//! for the whole duplicate-check → ceiling-check → increment sequence,
//! which is exactly the atomic region the Postgres backend gets from its
//! row lock. The outer map lock is only ever held briefly to look up or
//! insert an entry, so jobs never contend with each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
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

#[derive(Debug)]
struct JobEntry {
    job: JobRow,
    capped_in_epoch: bool,
    /// Retained across resets; attempt history outlives the acceptance cap.
    attempt_counts: HashMap<String, i64>,
    applications: Vec<ApplicationRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<JobEntry>>>>,
    batches: Mutex<HashMap<Uuid, ScreeningBatchRow>>,
    rankings: Mutex<HashMap<Uuid, RankingEntryRow>>,
    policy: LedgerPolicy,
}

impl MemoryStore {
    pub fn new(policy: LedgerPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    async fn entry(&self, job_id: Uuid) -> Result<Arc<Mutex<JobEntry>>, StoreError> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
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
        self.jobs.write().await.insert(
            job.id,
            Arc::new(Mutex::new(JobEntry {
                job: job.clone(),
                capped_in_epoch: false,
                attempt_counts: HashMap::new(),
                applications: Vec::new(),
            })),
        );
        Ok(job)
    }

    async fn job(&self, job_id: Uuid) -> Result<JobRow, StoreError> {
        let entry = self.entry(job_id).await?;
        let guard = entry.lock().await;
        Ok(guard.job.clone())
    }

    async fn update_job(&self, job_id: Uuid, patch: JobPatch) -> Result<JobRow, StoreError> {
        let entry = self.entry(job_id).await?;
        let mut guard = entry.lock().await;
        if let Some(limit) = patch.quota_limit {
            guard.job.quota_limit = limit;
        }
        if let Some(status) = patch.status {
            guard.job.status = status;
        }
        Ok(guard.job.clone())
    }

    async fn try_admit(
        &self,
        job_id: Uuid,
        fingerprint: &ApplicantFingerprint,
        cv_ref: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<AdmissionRecord, StoreError> {
        let entry = self.entry(job_id).await?;
        let mut guard = entry.lock().await;

        let epoch = guard.job.quota_epoch;
        let duplicate = guard.applications.iter().any(|a| {
            a.status == ApplicationStatus::Accepted
                && a.quota_epoch == epoch
                && a.fingerprint == fingerprint.as_str()
        });
        let verdict = evaluate(
            AdmitInputs {
                status: guard.job.status,
                quota_limit: guard.job.quota_limit,
                total_accepted: guard.job.total_accepted,
                capped_in_epoch: guard.capped_in_epoch,
                duplicate,
            },
            self.policy,
        );

        let attempt_count = {
            let count = guard
                .attempt_counts
                .entry(fingerprint.as_str().to_string())
                .or_insert(0);
            *count += 1;
            *count
        };

        let application_id = Uuid::new_v4();
        let (status, flagged_warn) = match verdict {
            AdmitVerdict::Accept { flagged_warn, caps_job } => {
                guard.job.total_accepted += 1;
                if caps_job {
                    guard.capped_in_epoch = true;
                }
                (ApplicationStatus::Accepted, flagged_warn)
            }
            AdmitVerdict::Duplicate => (ApplicationStatus::RejectedDuplicate, false),
            AdmitVerdict::Capped { mark_capped } => {
                if mark_capped {
                    guard.capped_in_epoch = true;
                }
                (ApplicationStatus::RejectedCapped, false)
            }
        };

        guard.applications.push(ApplicationRow {
            id: application_id,
            job_id,
            fingerprint: fingerprint.as_str().to_string(),
            status,
            flagged_warn,
            quota_epoch: epoch,
            cv_ref: cv_ref.to_string(),
            submitted_at,
        });

        let total_accepted = guard.job.total_accepted;
        let quota_limit = guard.job.quota_limit;
        Ok(match status {
            ApplicationStatus::Accepted => AdmissionRecord::Accepted {
                application_id,
                attempt_count,
                total_accepted,
                quota_limit,
                quota_epoch: epoch,
                flagged_warn,
            },
            ApplicationStatus::RejectedDuplicate => AdmissionRecord::Duplicate {
                application_id,
                attempt_count,
                total_accepted,
                quota_limit,
            },
            ApplicationStatus::RejectedCapped => AdmissionRecord::Capped {
                application_id,
                total_accepted,
                quota_limit,
            },
        })
    }

    async fn reset(&self, job_id: Uuid) -> Result<i64, StoreError> {
        let entry = self.entry(job_id).await?;
        let mut guard = entry.lock().await;
        guard.job.total_accepted = 0;
        guard.job.quota_epoch += 1;
        guard.capped_in_epoch = false;
        Ok(guard.job.quota_epoch)
    }

    async fn applications(&self, job_id: Uuid) -> Result<Vec<ApplicationRow>, StoreError> {
        let entry = self.entry(job_id).await?;
        let guard = entry.lock().await;
        Ok(guard.applications.clone())
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn insert_batch(&self, meta: &BatchMeta) -> Result<(), StoreError> {
        self.batches.lock().await.insert(
            meta.batch_id,
            ScreeningBatchRow {
                id: meta.batch_id,
                job_id: meta.job_id,
                quota_epoch: meta.quota_epoch,
                application_ids: Vec::new(),
                state: BatchState::Collecting,
                attempts: 0,
                created_at: meta.created_at,
                closed_at: None,
            },
        );
        Ok(())
    }

    async fn append_application(
        &self,
        batch_id: Uuid,
        application_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut batches = self.batches.lock().await;
        let row = batches
            .get_mut(&batch_id)
            .ok_or_else(|| StoreError::Unavailable(format!("batch {batch_id} not found")))?;
        row.application_ids.push(application_id);
        Ok(())
    }

    async fn mark_dispatched(&self, batch_id: Uuid, attempts: i32) -> Result<(), StoreError> {
        let mut batches = self.batches.lock().await;
        let row = batches
            .get_mut(&batch_id)
            .ok_or_else(|| StoreError::Unavailable(format!("batch {batch_id} not found")))?;
        row.state = BatchState::Dispatched;
        row.attempts = attempts;
        row.closed_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    async fn mark_completed(&self, batch_id: Uuid) -> Result<(), StoreError> {
        let mut batches = self.batches.lock().await;
        let row = batches
            .get_mut(&batch_id)
            .ok_or_else(|| StoreError::Unavailable(format!("batch {batch_id} not found")))?;
        row.state = BatchState::Completed;
        Ok(())
    }

    async fn mark_failed(&self, batch_id: Uuid, attempts: i32) -> Result<(), StoreError> {
        let mut batches = self.batches.lock().await;
        let row = batches
            .get_mut(&batch_id)
            .ok_or_else(|| StoreError::Unavailable(format!("batch {batch_id} not found")))?;
        row.state = BatchState::Failed;
        row.attempts = attempts;
        Ok(())
    }

    async fn batches_for_job(&self, job_id: Uuid) -> Result<Vec<ScreeningBatchRow>, StoreError> {
        let batches = self.batches.lock().await;
        let mut rows: Vec<ScreeningBatchRow> = batches
            .values()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl RankingStore for MemoryStore {
    async fn upsert_entries(&self, entries: &[NewRankingEntry]) -> Result<(), StoreError> {
        let mut rankings = self.rankings.lock().await;
        for entry in entries {
            rankings.insert(
                entry.application_id,
                RankingEntryRow {
                    application_id: entry.application_id,
                    job_id: entry.job_id,
                    score: entry.score,
                    reasoning: entry.reasoning.clone(),
                    quota_epoch: entry.quota_epoch,
                    superseded: false,
                    submitted_at: entry.submitted_at,
                    created_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn supersede_before_epoch(&self, job_id: Uuid, epoch: i64) -> Result<u64, StoreError> {
        let mut rankings = self.rankings.lock().await;
        let mut superseded = 0;
        for row in rankings.values_mut() {
            if row.job_id == job_id && row.quota_epoch < epoch && !row.superseded {
                row.superseded = true;
                superseded += 1;
            }
        }
        Ok(superseded)
    }

    async fn ranked_for_job(&self, job_id: Uuid) -> Result<Vec<RankedEntry>, StoreError> {
        let rankings = self.rankings.lock().await;
        let rows: Vec<RankingEntryRow> = rankings
            .values()
            .filter(|r| r.job_id == job_id && !r.superseded)
            .cloned()
            .collect();
        Ok(rank_entries(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(tag: &str) -> ApplicantFingerprint {
        use crate::identity::{FingerprintResolver, RequestSignals};
        FingerprintResolver::new(24).resolve(
            &RequestSignals {
                source_addr: Some(format!("203.0.113.{tag}")),
                user_agent: Some("test-agent".to_string()),
                device_signal: Some(tag.to_string()),
            },
            Utc::now(),
        )
    }

    async fn job_with_limit(store: &MemoryStore, limit: i64) -> JobRow {
        store
            .create_job(NewJob {
                owner_id: Uuid::new_v4(),
                title: "Platform Engineer".to_string(),
                description: "Distributed systems".to_string(),
                quota_limit: limit,
            })
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_applies_never_overshoot_the_cap() {
        let store = Arc::new(MemoryStore::new(LedgerPolicy::default()));
        let job = job_with_limit(&store, 10).await;

        let mut handles = Vec::new();
        for n in 0..500u32 {
            let store = store.clone();
            let job_id = job.id;
            handles.push(tokio::spawn(async move {
                let fp = fingerprint(&n.to_string());
                store
                    .try_admit(job_id, &fp, &format!("cv://{n}"), Utc::now())
                    .await
                    .unwrap()
            }));
        }

        let mut accepted = 0;
        let mut capped = 0;
        for handle in handles {
            match handle.await.unwrap() {
                AdmissionRecord::Accepted { .. } => accepted += 1,
                AdmissionRecord::Capped { .. } => capped += 1,
                AdmissionRecord::Duplicate { .. } => panic!("distinct fingerprints cannot dup"),
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(capped, 490);
        assert_eq!(store.job(job.id).await.unwrap().total_accepted, 10);
    }

    #[tokio::test]
    async fn same_fingerprint_accepts_once_per_epoch() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let job = job_with_limit(&store, 100).await;
        let fp = fingerprint("7");

        let mut statuses = Vec::new();
        for n in 0..5 {
            let record = store
                .try_admit(job.id, &fp, &format!("cv://{n}"), Utc::now())
                .await
                .unwrap();
            statuses.push(record);
        }

        assert!(matches!(statuses[0], AdmissionRecord::Accepted { .. }));
        for record in &statuses[1..] {
            assert!(matches!(record, AdmissionRecord::Duplicate { .. }));
        }
        // The attempt counter keeps counting even though only one accept
        // consumed a quota slot.
        match statuses.last().unwrap() {
            AdmissionRecord::Duplicate { attempt_count, .. } => assert_eq!(*attempt_count, 5),
            other => panic!("unexpected record: {other:?}"),
        }
        assert_eq!(store.job(job.id).await.unwrap().total_accepted, 1);
    }

    #[tokio::test]
    async fn reset_starts_a_new_epoch_and_readmits_once() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let job = job_with_limit(&store, 100).await;
        let fp = fingerprint("9");

        store.try_admit(job.id, &fp, "cv://a", Utc::now()).await.unwrap();
        let dup = store.try_admit(job.id, &fp, "cv://b", Utc::now()).await.unwrap();
        assert!(matches!(dup, AdmissionRecord::Duplicate { .. }));

        let new_epoch = store.reset(job.id).await.unwrap();
        assert_eq!(new_epoch, 1);
        let after = store.job(job.id).await.unwrap();
        assert_eq!(after.total_accepted, 0);

        // Exactly one accept in the fresh epoch, then duplicates again.
        let readmitted = store.try_admit(job.id, &fp, "cv://c", Utc::now()).await.unwrap();
        assert!(matches!(readmitted, AdmissionRecord::Accepted { .. }));
        let dup_again = store.try_admit(job.id, &fp, "cv://d", Utc::now()).await.unwrap();
        assert!(matches!(dup_again, AdmissionRecord::Duplicate { .. }));

        // Attempt history survived the reset.
        match dup_again {
            AdmissionRecord::Duplicate { attempt_count, .. } => assert_eq!(attempt_count, 4),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn limit_raise_reopens_admission_by_default() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let job = job_with_limit(&store, 1).await;

        let first = store
            .try_admit(job.id, &fingerprint("1"), "cv://1", Utc::now())
            .await
            .unwrap();
        assert!(matches!(first, AdmissionRecord::Accepted { .. }));
        let capped = store
            .try_admit(job.id, &fingerprint("2"), "cv://2", Utc::now())
            .await
            .unwrap();
        assert!(matches!(capped, AdmissionRecord::Capped { .. }));

        store
            .update_job(
                job.id,
                JobPatch {
                    quota_limit: Some(5),
                    status: None,
                },
            )
            .await
            .unwrap();
        let retried = store
            .try_admit(job.id, &fingerprint("2"), "cv://2", Utc::now())
            .await
            .unwrap();
        assert!(matches!(retried, AdmissionRecord::Accepted { .. }));
    }

    #[tokio::test]
    async fn sticky_policy_keeps_job_closed_after_limit_raise() {
        let store = MemoryStore::new(LedgerPolicy {
            readmit_after_limit_raise: false,
        });
        let job = job_with_limit(&store, 1).await;

        store
            .try_admit(job.id, &fingerprint("1"), "cv://1", Utc::now())
            .await
            .unwrap();
        store
            .update_job(
                job.id,
                JobPatch {
                    quota_limit: Some(5),
                    status: None,
                },
            )
            .await
            .unwrap();

        let retried = store
            .try_admit(job.id, &fingerprint("2"), "cv://2", Utc::now())
            .await
            .unwrap();
        assert!(matches!(retried, AdmissionRecord::Capped { .. }));

        // An explicit reset reopens even under the sticky policy.
        store.reset(job.id).await.unwrap();
        let after_reset = store
            .try_admit(job.id, &fingerprint("2"), "cv://2", Utc::now())
            .await
            .unwrap();
        assert!(matches!(after_reset, AdmissionRecord::Accepted { .. }));
    }

    #[tokio::test]
    async fn closed_job_rejects_applies() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let job = job_with_limit(&store, 100).await;
        store
            .update_job(
                job.id,
                JobPatch {
                    quota_limit: None,
                    status: Some(JobStatus::Closed),
                },
            )
            .await
            .unwrap();

        let record = store
            .try_admit(job.id, &fingerprint("1"), "cv://1", Utc::now())
            .await
            .unwrap();
        assert!(matches!(record, AdmissionRecord::Capped { .. }));
        assert_eq!(store.job(job.id).await.unwrap().total_accepted, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let missing = Uuid::new_v4();
        match store.job(missing).await {
            Err(StoreError::JobNotFound(id)) => assert_eq!(id, missing),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_attempt_leaves_an_application_row() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let job = job_with_limit(&store, 1).await;
        let fp = fingerprint("1");

        store.try_admit(job.id, &fp, "cv://1", Utc::now()).await.unwrap();
        store.try_admit(job.id, &fp, "cv://1", Utc::now()).await.unwrap();
        store
            .try_admit(job.id, &fingerprint("2"), "cv://2", Utc::now())
            .await
            .unwrap();

        let log = store.applications(job.id).await.unwrap();
        let statuses: Vec<_> = log.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![
                ApplicationStatus::Accepted,
                ApplicationStatus::RejectedDuplicate,
                ApplicationStatus::RejectedCapped
            ]
        );
    }

    #[tokio::test]
    async fn accepts_inside_the_soft_warn_band_are_flagged() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let job = job_with_limit(&store, 5).await;

        for n in 0..4 {
            store
                .try_admit(job.id, &fingerprint(&n.to_string()), "cv://x", Utc::now())
                .await
                .unwrap();
        }

        let log = store.applications(job.id).await.unwrap();
        let flags: Vec<bool> = log.iter().map(|a| a.flagged_warn).collect();
        // The fourth accept lands at 4/5 = 80% and carries the warning.
        assert_eq!(flags, vec![false, false, false, true]);
        let ids: std::collections::HashSet<Uuid> = log.iter().map(|a| a.id).collect();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn rankings_supersede_across_epochs() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let job = job_with_limit(&store, 100).await;
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        store
            .upsert_entries(&[NewRankingEntry {
                application_id: old,
                job_id: job.id,
                score: 80,
                reasoning: "epoch 0".to_string(),
                quota_epoch: 0,
                submitted_at: Utc::now(),
            }])
            .await
            .unwrap();
        assert_eq!(store.supersede_before_epoch(job.id, 1).await.unwrap(), 1);
        store
            .upsert_entries(&[NewRankingEntry {
                application_id: fresh,
                job_id: job.id,
                score: 60,
                reasoning: "epoch 1".to_string(),
                quota_epoch: 1,
                submitted_at: Utc::now(),
            }])
            .await
            .unwrap();

        let ranked = store.ranked_for_job(job.id).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].application_id, fresh);
    }

    #[tokio::test]
    async fn ranking_upsert_is_idempotent() {
        let store = MemoryStore::new(LedgerPolicy::default());
        let job = job_with_limit(&store, 100).await;
        let entry = NewRankingEntry {
            application_id: Uuid::new_v4(),
            job_id: job.id,
            score: 70,
            reasoning: "solid".to_string(),
            quota_epoch: 0,
            submitted_at: Utc::now(),
        };

        store.upsert_entries(std::slice::from_ref(&entry)).await.unwrap();
        store.upsert_entries(std::slice::from_ref(&entry)).await.unwrap();

        assert_eq!(store.ranked_for_job(job.id).await.unwrap().len(), 1);
    }
}
