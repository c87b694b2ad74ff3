//! Pure batch accumulation. No I/O here — the coordinator owns persistence
//! and dispatch; this module owns the bookkeeping rules:
//!
//! - a batch closes when it reaches capacity; the application that would be
//!   one past capacity opens a new batch instead of growing the old one
//! - a quota reset (epoch bump) closes the collecting batch so post-reset
//!   accepts land in a fresh one
//! - accepts carrying an epoch older than the job's current one are stale
//!   in-flight decisions and are dropped, not mixed into the new epoch

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Hard ceiling on applications per screening batch. The scoring capability
/// is billed per call with a 200-CV input limit; this is a contract bound,
/// not a tuning knob.
pub const MAX_BATCH_SIZE: usize = 200;

/// One accepted application queued for screening.
#[derive(Debug, Clone)]
pub struct BatchApplication {
    pub application_id: Uuid,
    pub cv_ref: String,
    pub submitted_at: DateTime<Utc>,
}

/// A batch still collecting applications. Closed batches are handed to the
/// dispatcher by value; the book keeps no reference to them.
#[derive(Debug, Clone)]
pub struct CollectingBatch {
    pub id: Uuid,
    pub job_id: Uuid,
    pub quota_epoch: i64,
    pub applications: Vec<BatchApplication>,
    pub created_at: DateTime<Utc>,
}

/// Identity of a batch at open time, for persistence and feed events.
#[derive(Debug, Clone, Copy)]
pub struct BatchMeta {
    pub batch_id: Uuid,
    pub job_id: Uuid,
    pub quota_epoch: i64,
    pub created_at: DateTime<Utc>,
}

impl CollectingBatch {
    fn meta(&self) -> BatchMeta {
        BatchMeta {
            batch_id: self.id,
            job_id: self.job_id,
            quota_epoch: self.quota_epoch,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordOutcome {
    /// Batches closed by this call, in close order. Each is ready for
    /// dispatch.
    pub closed: Vec<CollectingBatch>,
    /// Set when this call opened a new collecting batch.
    pub opened: Option<BatchMeta>,
    /// The batch the application landed in and its size after the append.
    pub appended: Option<(Uuid, usize)>,
    /// The application carried a pre-reset epoch and was dropped.
    pub stale: bool,
}

#[derive(Debug)]
pub struct BatchBook {
    capacity: usize,
    open: HashMap<Uuid, CollectingBatch>,
    /// Highest epoch observed per job; accepts below it are stale.
    epochs: HashMap<Uuid, i64>,
}

impl BatchBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.clamp(1, MAX_BATCH_SIZE),
            open: HashMap::new(),
            epochs: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records one accepted application for a job in the given epoch.
    pub fn record(
        &mut self,
        job_id: Uuid,
        quota_epoch: i64,
        application: BatchApplication,
        now: DateTime<Utc>,
    ) -> RecordOutcome {
        let mut outcome = RecordOutcome::default();

        let known_epoch = self.epochs.entry(job_id).or_insert(quota_epoch);
        if quota_epoch < *known_epoch {
            outcome.stale = true;
            return outcome;
        }
        *known_epoch = quota_epoch;

        // A collecting batch from before the reset closes now; its contents
        // were accepted under the old epoch.
        if self
            .open
            .get(&job_id)
            .is_some_and(|b| b.quota_epoch < quota_epoch)
        {
            outcome.closed.extend(self.open.remove(&job_id));
        }

        let batch = self.open.entry(job_id).or_insert_with(|| {
            let fresh = CollectingBatch {
                id: Uuid::new_v4(),
                job_id,
                quota_epoch,
                applications: Vec::new(),
                created_at: now,
            };
            outcome.opened = Some(fresh.meta());
            fresh
        });
        batch.applications.push(application);
        let (batch_id, size) = (batch.id, batch.applications.len());
        outcome.appended = Some((batch_id, size));

        if size >= self.capacity {
            outcome.closed.extend(self.open.remove(&job_id));
        }
        outcome
    }

    /// Closes the collecting batch for a job, if any. With
    /// `before_epoch = Some(e)` the batch closes only when it belongs to an
    /// epoch older than `e` (the reset path); `None` closes unconditionally
    /// (the manual trigger path).
    pub fn close(&mut self, job_id: Uuid, before_epoch: Option<i64>) -> Option<CollectingBatch> {
        if let Some(e) = before_epoch {
            let current = self.epochs.entry(job_id).or_insert(e);
            if e > *current {
                *current = e;
            }
            if self.open.get(&job_id).is_some_and(|b| b.quota_epoch >= e) {
                return None;
            }
        }
        self.open.remove(&job_id)
    }

    /// Metadata of the collecting batch for a job, for the dashboard.
    pub fn open_batch(&self, job_id: Uuid) -> Option<(BatchMeta, usize)> {
        self.open
            .get(&job_id)
            .map(|b| (b.meta(), b.applications.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(n: u32) -> BatchApplication {
        BatchApplication {
            application_id: Uuid::new_v4(),
            cv_ref: format!("cv://{n}"),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn batch_closes_at_capacity_and_next_accept_opens_fresh() {
        let mut book = BatchBook::new(3);
        let job = Uuid::new_v4();
        let now = Utc::now();

        let first = book.record(job, 0, app(0), now);
        assert!(first.opened.is_some());
        assert!(first.closed.is_empty());

        book.record(job, 0, app(1), now);
        let third = book.record(job, 0, app(2), now);
        assert_eq!(third.closed.len(), 1);
        assert_eq!(third.closed[0].applications.len(), 3);
        assert!(book.open_batch(job).is_none());

        let fourth = book.record(job, 0, app(3), now);
        assert!(fourth.opened.is_some());
        assert_ne!(
            fourth.opened.unwrap().batch_id,
            third.closed[0].id,
            "a closed batch must never be reopened"
        );
    }

    #[test]
    fn a_batch_never_exceeds_two_hundred_applications() {
        let mut book = BatchBook::new(MAX_BATCH_SIZE);
        let job = Uuid::new_v4();
        let now = Utc::now();

        let mut closed = Vec::new();
        for n in 0..201 {
            closed.extend(book.record(job, 0, app(n), now).closed);
        }
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].applications.len(), 200);
        // The 201st application sits in a new batch of one.
        let (_, size) = book.open_batch(job).unwrap();
        assert_eq!(size, 1);
    }

    #[test]
    fn capacity_is_clamped_to_the_hard_ceiling() {
        assert_eq!(BatchBook::new(5000).capacity(), MAX_BATCH_SIZE);
        assert_eq!(BatchBook::new(0).capacity(), 1);
    }

    #[test]
    fn epoch_bump_closes_the_old_batch() {
        let mut book = BatchBook::new(10);
        let job = Uuid::new_v4();
        let now = Utc::now();

        book.record(job, 0, app(0), now);
        book.record(job, 0, app(1), now);
        let post_reset = book.record(job, 1, app(2), now);

        assert_eq!(post_reset.closed.len(), 1);
        assert_eq!(post_reset.closed[0].quota_epoch, 0);
        assert_eq!(post_reset.closed[0].applications.len(), 2);
        let (meta, size) = book.open_batch(job).unwrap();
        assert_eq!(meta.quota_epoch, 1);
        assert_eq!(size, 1);
    }

    #[test]
    fn stale_epoch_accept_is_dropped() {
        let mut book = BatchBook::new(10);
        let job = Uuid::new_v4();
        let now = Utc::now();

        book.record(job, 2, app(0), now);
        let stale = book.record(job, 1, app(1), now);
        assert!(stale.stale);
        assert_eq!(book.open_batch(job).unwrap().1, 1);
    }

    #[test]
    fn reset_close_only_touches_older_epochs() {
        let mut book = BatchBook::new(10);
        let job = Uuid::new_v4();
        let now = Utc::now();

        // Accept tagged with the new epoch arrived before the reset message.
        book.record(job, 1, app(0), now);
        assert!(book.close(job, Some(1)).is_none());
        assert!(book.open_batch(job).is_some());

        assert!(book.close(job, Some(2)).is_some());
    }

    #[test]
    fn manual_close_is_unconditional() {
        let mut book = BatchBook::new(10);
        let job = Uuid::new_v4();
        assert!(book.close(job, None).is_none());

        book.record(job, 0, app(0), Utc::now());
        let closed = book.close(job, None).unwrap();
        assert_eq!(closed.applications.len(), 1);
    }

    #[test]
    fn jobs_do_not_share_batches() {
        let mut book = BatchBook::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let now = Utc::now();

        book.record(a, 0, app(0), now);
        let out = book.record(b, 0, app(1), now);
        assert!(out.closed.is_empty());
        assert_eq!(book.open_batch(a).unwrap().1, 1);
        assert_eq!(book.open_batch(b).unwrap().1, 1);
    }
}
