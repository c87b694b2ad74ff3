//! Batch screening — accumulates accepted applications into bounded
//! batches and dispatches them to the scoring capability.

pub mod batch;
pub mod coordinator;

use async_trait::async_trait;
use uuid::Uuid;

use crate::ledger::StoreError;
use crate::models::batch::ScreeningBatchRow;
use crate::screening::batch::BatchMeta;

/// Persistence contract for screening batches. Implemented by the same
/// backends as the quota ledger.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Records a newly opened collecting batch.
    async fn insert_batch(&self, meta: &BatchMeta) -> Result<(), StoreError>;

    /// Appends one application reference to a collecting batch.
    async fn append_application(
        &self,
        batch_id: Uuid,
        application_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn mark_dispatched(&self, batch_id: Uuid, attempts: i32) -> Result<(), StoreError>;

    async fn mark_completed(&self, batch_id: Uuid) -> Result<(), StoreError>;

    async fn mark_failed(&self, batch_id: Uuid, attempts: i32) -> Result<(), StoreError>;

    /// All batches for a job, oldest first. Feeds the dashboard snapshot.
    async fn batches_for_job(&self, job_id: Uuid) -> Result<Vec<ScreeningBatchRow>, StoreError>;
}
