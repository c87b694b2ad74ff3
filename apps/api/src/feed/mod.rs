//! Dashboard Feed — fan-out of quota and batch state changes to
//! operator-facing consumers. Owns no business logic.
//!
//! In-process consumers subscribe to the broadcast channel; the external UI
//! polls `GET /api/v1/jobs/:id/dashboard` for the same state.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::admission::QuotaState;
use crate::models::batch::BatchState;

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    QuotaChanged {
        job_id: Uuid,
        total_accepted: i64,
        quota_limit: i64,
        state: QuotaState,
    },
    BatchChanged {
        job_id: Uuid,
        batch_id: Uuid,
        state: BatchState,
        attempts: i32,
    },
}

#[derive(Clone)]
pub struct DashboardFeed {
    tx: broadcast::Sender<FeedEvent>,
}

impl Default for DashboardFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl DashboardFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    /// Emitted on every admission decision and on every quota reset.
    pub fn quota_changed(
        &self,
        job_id: Uuid,
        total_accepted: i64,
        quota_limit: i64,
        state: QuotaState,
    ) {
        // A send with no subscribers is normal; the poll endpoint still
        // serves the same state.
        let _ = self.tx.send(FeedEvent::QuotaChanged {
            job_id,
            total_accepted,
            quota_limit,
            state,
        });
    }

    /// Emitted on every screening batch state transition.
    pub fn batch_changed(&self, job_id: Uuid, batch_id: Uuid, state: BatchState, attempts: i32) {
        let _ = self.tx.send(FeedEvent::BatchChanged {
            job_id,
            batch_id,
            state,
            attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let feed = DashboardFeed::new();
        let mut rx = feed.subscribe();
        let job = Uuid::new_v4();
        let batch = Uuid::new_v4();

        feed.quota_changed(job, 1, 10, QuotaState::Open);
        feed.batch_changed(job, batch, BatchState::Dispatched, 1);

        match rx.recv().await.unwrap() {
            FeedEvent::QuotaChanged {
                total_accepted, ..
            } => assert_eq!(total_accepted, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            FeedEvent::BatchChanged { state, .. } => assert_eq!(state, BatchState::Dispatched),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sending_without_subscribers_does_not_panic() {
        let feed = DashboardFeed::new();
        feed.quota_changed(Uuid::new_v4(), 0, 10, QuotaState::Open);
    }
}
