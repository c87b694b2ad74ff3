//! Batch Coordinator — the background task between admission and the
//! scoring capability.
//!
//! Accepted applications arrive over an unbounded channel, so the apply
//! path never blocks on screening. Dispatches are spawned tasks bounded by
//! a timeout; the quota ledger lock is long released by the time a scorer
//! call starts. Each batch gets exactly one automatic retry — the scoring
//! capability is billed per call, so the retry budget is a hard limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::feed::DashboardFeed;
use crate::ledger::{QuotaLedger, StoreError};
use crate::models::batch::BatchState;
use crate::rankings::{NewRankingEntry, RankingStore};
use crate::scoring::{JobContext, ResumeScorer, ScoringError};
use crate::screening::batch::{BatchApplication, BatchBook, CollectingBatch};
use crate::screening::BatchStore;

/// Total dispatch attempts per batch: the original plus one automatic
/// retry. Never raised — unbounded retry against a paid API is disallowed.
pub const MAX_DISPATCH_ATTEMPTS: i32 = 2;

#[derive(Debug)]
enum CoordinatorMsg {
    ApplicationAccepted {
        job_id: Uuid,
        quota_epoch: i64,
        application: BatchApplication,
    },
    ScreeningTriggered {
        job_id: Uuid,
    },
    QuotaReset {
        job_id: Uuid,
        new_epoch: i64,
    },
}

/// Fire-and-forget handle used from the request path.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorMsg>,
}

impl CoordinatorHandle {
    pub fn application_accepted(
        &self,
        job_id: Uuid,
        quota_epoch: i64,
        application: BatchApplication,
    ) {
        self.send(CoordinatorMsg::ApplicationAccepted {
            job_id,
            quota_epoch,
            application,
        });
    }

    /// The job owner invoked screening manually.
    pub fn trigger_screening(&self, job_id: Uuid) {
        self.send(CoordinatorMsg::ScreeningTriggered { job_id });
    }

    /// A quota reset auto-triggers screening of whatever was collecting.
    pub fn quota_reset(&self, job_id: Uuid, new_epoch: i64) {
        self.send(CoordinatorMsg::QuotaReset { job_id, new_epoch });
    }

    fn send(&self, msg: CoordinatorMsg) {
        if self.tx.send(msg).is_err() {
            warn!("batch coordinator is not running; screening message dropped");
        }
    }
}

/// Shared handles the coordinator and its dispatch tasks need.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub ledger: Arc<dyn QuotaLedger>,
    pub batches: Arc<dyn BatchStore>,
    pub rankings: Arc<dyn RankingStore>,
    pub scorer: Arc<dyn ResumeScorer>,
    pub feed: DashboardFeed,
    pub dispatch_timeout: Duration,
}

pub struct BatchCoordinator {
    rx: mpsc::UnboundedReceiver<CoordinatorMsg>,
    book: BatchBook,
    deps: CoordinatorDeps,
}

impl BatchCoordinator {
    /// Spawns the coordinator task and returns the handle admission and the
    /// admin routes talk to.
    pub fn spawn(batch_capacity: usize, deps: CoordinatorDeps) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            rx,
            book: BatchBook::new(batch_capacity),
            deps,
        };
        tokio::spawn(coordinator.run());
        CoordinatorHandle { tx }
    }

    async fn run(mut self) {
        info!(capacity = self.book.capacity(), "batch coordinator started");
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg).await;
        }
        info!("batch coordinator stopped");
    }

    async fn handle(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::ApplicationAccepted {
                job_id,
                quota_epoch,
                application,
            } => {
                let application_id = application.application_id;
                let outcome = self.book.record(job_id, quota_epoch, application, Utc::now());

                if outcome.stale {
                    warn!(
                        %job_id,
                        %application_id,
                        quota_epoch,
                        "accepted application carries a pre-reset epoch; not batching"
                    );
                    return;
                }
                if let Some(meta) = outcome.opened {
                    if let Err(e) = self.deps.batches.insert_batch(&meta).await {
                        warn!(batch_id = %meta.batch_id, error = %e, "failed to persist new batch");
                    }
                    self.deps
                        .feed
                        .batch_changed(job_id, meta.batch_id, BatchState::Collecting, 0);
                }
                if let Some((batch_id, size)) = outcome.appended {
                    debug!(%job_id, %batch_id, size, "application batched");
                    if let Err(e) = self
                        .deps
                        .batches
                        .append_application(batch_id, application_id)
                        .await
                    {
                        warn!(%batch_id, error = %e, "failed to persist batch membership");
                    }
                }
                for closed in outcome.closed {
                    self.spawn_dispatch(closed);
                }
            }
            CoordinatorMsg::ScreeningTriggered { job_id } => {
                match self.book.close(job_id, None) {
                    Some(batch) => self.spawn_dispatch(batch),
                    None => debug!(%job_id, "screening triggered with nothing collecting"),
                }
            }
            CoordinatorMsg::QuotaReset { job_id, new_epoch } => {
                match self.book.close(job_id, Some(new_epoch)) {
                    Some(batch) => self.spawn_dispatch(batch),
                    None => debug!(%job_id, new_epoch, "quota reset with nothing to screen"),
                }
            }
        }
    }

    fn spawn_dispatch(&self, batch: CollectingBatch) {
        let deps = self.deps.clone();
        tokio::spawn(dispatch_batch(deps, batch));
    }
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scoring(#[from] ScoringError),
}

/// Runs a closed batch through the scoring capability, retrying once.
pub(crate) async fn dispatch_batch(deps: CoordinatorDeps, batch: CollectingBatch) {
    info!(
        batch_id = %batch.id,
        job_id = %batch.job_id,
        size = batch.applications.len(),
        "dispatching screening batch"
    );

    for attempt in 1..=MAX_DISPATCH_ATTEMPTS {
        if let Err(e) = deps.batches.mark_dispatched(batch.id, attempt).await {
            warn!(batch_id = %batch.id, error = %e, "failed to persist dispatched state");
        }
        deps.feed
            .batch_changed(batch.job_id, batch.id, BatchState::Dispatched, attempt);

        match run_attempt(&deps, &batch).await {
            Ok(entry_count) => {
                if let Err(e) = deps.batches.mark_completed(batch.id).await {
                    warn!(batch_id = %batch.id, error = %e, "failed to persist completed state");
                }
                deps.feed
                    .batch_changed(batch.job_id, batch.id, BatchState::Completed, attempt);
                info!(
                    batch_id = %batch.id,
                    job_id = %batch.job_id,
                    entry_count,
                    attempt,
                    "screening batch completed"
                );
                return;
            }
            Err(e) => {
                warn!(
                    batch_id = %batch.id,
                    attempt,
                    error = %e,
                    "screening dispatch attempt failed"
                );
                if let Err(e) = deps.batches.mark_failed(batch.id, attempt).await {
                    warn!(batch_id = %batch.id, error = %e, "failed to persist failed state");
                }
                deps.feed
                    .batch_changed(batch.job_id, batch.id, BatchState::Failed, attempt);
            }
        }
    }

    error!(
        batch_id = %batch.id,
        job_id = %batch.job_id,
        "screening batch failed permanently; operator action required"
    );
}

async fn run_attempt(
    deps: &CoordinatorDeps,
    batch: &CollectingBatch,
) -> Result<usize, DispatchError> {
    let job = deps.ledger.job(batch.job_id).await?;
    let context = JobContext {
        job_id: job.id,
        title: job.title,
        description: job.description,
    };

    let scored = match tokio::time::timeout(
        deps.dispatch_timeout,
        deps.scorer.score_batch(&context, &batch.applications),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(ScoringError::Timeout.into()),
    };

    let submitted: HashMap<Uuid, DateTime<Utc>> = batch
        .applications
        .iter()
        .map(|a| (a.application_id, a.submitted_at))
        .collect();
    let entries: Vec<NewRankingEntry> = scored
        .into_iter()
        .filter_map(|s| {
            submitted.get(&s.application_id).map(|&at| NewRankingEntry {
                application_id: s.application_id,
                job_id: batch.job_id,
                score: s.score,
                reasoning: s.reasoning,
                quota_epoch: batch.quota_epoch,
                submitted_at: at,
            })
        })
        .collect();

    // Earlier-epoch rankings survive as history; the ranked view shows the
    // freshest screening only.
    deps.rankings
        .supersede_before_epoch(batch.job_id, batch.quota_epoch)
        .await?;
    deps.rankings.upsert_entries(&entries).await?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::feed::FeedEvent;
    use crate::ledger::{NewJob, QuotaLedger};
    use crate::scoring::ScoredApplication;
    use crate::screening::batch::BatchMeta;
    use crate::store::memory::MemoryStore;

    /// Scripted scorer: pops one outcome per call.
    #[derive(Debug)]
    enum Outcome {
        Score,
        Fail,
        Hang,
    }

    struct ScriptedScorer {
        script: Mutex<VecDeque<Outcome>>,
    }

    impl ScriptedScorer {
        fn new(script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl ResumeScorer for ScriptedScorer {
        async fn score_batch(
            &self,
            _job: &JobContext,
            applications: &[BatchApplication],
        ) -> Result<Vec<ScoredApplication>, ScoringError> {
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("scorer called more times than scripted");
            match outcome {
                Outcome::Score => Ok(applications
                    .iter()
                    .enumerate()
                    .map(|(i, a)| ScoredApplication {
                        application_id: a.application_id,
                        score: 90 - i as i32,
                        reasoning: "scripted".to_string(),
                    })
                    .collect()),
                Outcome::Fail => Err(ScoringError::Invalid("scripted failure".to_string())),
                Outcome::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn app(n: u32) -> BatchApplication {
        BatchApplication {
            application_id: Uuid::new_v4(),
            cv_ref: format!("cv://{n}"),
            submitted_at: Utc::now(),
        }
    }

    async fn deps_with_job(
        scorer: Arc<dyn ResumeScorer>,
        timeout: Duration,
    ) -> (CoordinatorDeps, Uuid) {
        let store = Arc::new(MemoryStore::new(Default::default()));
        let job = store
            .create_job(NewJob {
                owner_id: Uuid::new_v4(),
                title: "Backend Engineer".to_string(),
                description: "Rust, async, Postgres".to_string(),
                quota_limit: 100,
            })
            .await
            .unwrap();
        let deps = CoordinatorDeps {
            ledger: store.clone(),
            batches: store.clone(),
            rankings: store,
            scorer,
            feed: DashboardFeed::new(),
            dispatch_timeout: timeout,
        };
        (deps, job.id)
    }

    /// Builds a closed batch and records it the way the coordinator would
    /// have while it was collecting.
    async fn batch_of(
        deps: &CoordinatorDeps,
        job_id: Uuid,
        apps: Vec<BatchApplication>,
    ) -> CollectingBatch {
        let batch = CollectingBatch {
            id: Uuid::new_v4(),
            job_id,
            quota_epoch: 0,
            applications: apps,
            created_at: Utc::now(),
        };
        deps.batches
            .insert_batch(&BatchMeta {
                batch_id: batch.id,
                job_id: batch.job_id,
                quota_epoch: batch.quota_epoch,
                created_at: batch.created_at,
            })
            .await
            .unwrap();
        for application in &batch.applications {
            deps.batches
                .append_application(batch.id, application.application_id)
                .await
                .unwrap();
        }
        batch
    }

    #[tokio::test]
    async fn successful_dispatch_completes_and_ranks() {
        let scorer = ScriptedScorer::new([Outcome::Score]);
        let (deps, job_id) = deps_with_job(scorer, Duration::from_secs(30)).await;
        let batch = batch_of(&deps, job_id, vec![app(0), app(1)]).await;
        let batch_id = batch.id;

        dispatch_batch(deps.clone(), batch).await;

        let rows = deps.batches.batches_for_job(job_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, batch_id);
        assert_eq!(rows[0].state, BatchState::Completed);
        assert_eq!(rows[0].attempts, 1);

        let ranked = deps.rankings.ranked_for_job(job_id).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].score >= ranked[1].score);
    }

    #[tokio::test]
    async fn first_failure_retries_once_then_completes() {
        let scorer = ScriptedScorer::new([Outcome::Fail, Outcome::Score]);
        let (deps, job_id) = deps_with_job(scorer, Duration::from_secs(30)).await;
        let mut events = deps.feed.subscribe();
        let batch = batch_of(&deps, job_id, vec![app(0)]).await;

        dispatch_batch(deps.clone(), batch).await;

        let rows = deps.batches.batches_for_job(job_id).await.unwrap();
        assert_eq!(rows[0].state, BatchState::Completed);
        assert_eq!(rows[0].attempts, 2);

        let mut states = Vec::new();
        while let Ok(FeedEvent::BatchChanged { state, .. }) = events.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                BatchState::Dispatched,
                BatchState::Failed,
                BatchState::Dispatched,
                BatchState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn second_failure_is_terminal() {
        let scorer = ScriptedScorer::new([Outcome::Fail, Outcome::Fail]);
        let (deps, job_id) = deps_with_job(scorer, Duration::from_secs(30)).await;
        let batch = batch_of(&deps, job_id, vec![app(0)]).await;

        dispatch_batch(deps.clone(), batch).await;

        let rows = deps.batches.batches_for_job(job_id).await.unwrap();
        assert_eq!(rows[0].state, BatchState::Failed);
        assert_eq!(rows[0].attempts, MAX_DISPATCH_ATTEMPTS);
        assert!(deps.rankings.ranked_for_job(job_id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_scorer_times_out_and_counts_as_a_failure() {
        let scorer = ScriptedScorer::new([Outcome::Hang, Outcome::Hang]);
        let (deps, job_id) = deps_with_job(scorer, Duration::from_secs(60)).await;
        let batch = batch_of(&deps, job_id, vec![app(0)]).await;

        dispatch_batch(deps.clone(), batch).await;

        let rows = deps.batches.batches_for_job(job_id).await.unwrap();
        assert_eq!(rows[0].state, BatchState::Failed);
        assert_eq!(rows[0].attempts, MAX_DISPATCH_ATTEMPTS);
    }

    #[tokio::test]
    async fn coordinator_dispatches_when_capacity_reached() {
        let scorer = ScriptedScorer::new([Outcome::Score]);
        let (deps, job_id) = deps_with_job(scorer, Duration::from_secs(30)).await;
        let mut events = deps.feed.subscribe();
        let handle = BatchCoordinator::spawn(2, deps.clone());

        handle.application_accepted(job_id, 0, app(0));
        handle.application_accepted(job_id, 0, app(1));

        // Collecting → Dispatched → Completed, in order, within the timeout.
        let mut states = Vec::new();
        while states.last() != Some(&BatchState::Completed) {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("feed event timed out")
                .unwrap();
            if let FeedEvent::BatchChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                BatchState::Collecting,
                BatchState::Dispatched,
                BatchState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn reset_triggers_exactly_one_new_batch_for_post_reset_accepts() {
        let scorer = ScriptedScorer::new([Outcome::Score, Outcome::Score]);
        let (deps, job_id) = deps_with_job(scorer, Duration::from_secs(30)).await;
        let mut events = deps.feed.subscribe();
        let handle = BatchCoordinator::spawn(100, deps.clone());

        let pre = app(0);
        handle.application_accepted(job_id, 0, pre);
        handle.quota_reset(job_id, 1);
        let post_a = app(1);
        let post_b = app(2);
        handle.application_accepted(job_id, 1, post_a.clone());
        handle.application_accepted(job_id, 1, post_b.clone());
        handle.trigger_screening(job_id);

        // Wait for both dispatched batches to complete.
        let mut completed = 0;
        while completed < 2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("feed event timed out")
                .unwrap();
            if let FeedEvent::BatchChanged {
                state: BatchState::Completed,
                ..
            } = event
            {
                completed += 1;
            }
        }

        let rows = deps.batches.batches_for_job(job_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let post_reset: Vec<_> = rows.iter().filter(|b| b.quota_epoch == 1).collect();
        assert_eq!(post_reset.len(), 1, "exactly one post-reset batch");
        assert_eq!(
            post_reset[0].application_ids,
            vec![post_a.application_id, post_b.application_id]
        );
    }
}
