use async_trait::async_trait;
use uuid::Uuid;

use crate::bulk_jobs::models::{BulkJob, BulkJobStatus, JobCompletion};
use lumen_common::error::LumenResult;

#[async_trait]
pub trait BulkJobRepository: Send + Sync {
    async fn create(&self, job: BulkJob) -> LumenResult<BulkJob>;

    /// Record a terminal state with final counters and a completion timestamp.
    async fn finish(
        &self,
        id: Uuid,
        status: BulkJobStatus,
        completion: JobCompletion,
    ) -> LumenResult<BulkJob>;

    /// Audit trail for one connection, newest first.
    async fn list_for_connection(&self, connection_id: Uuid) -> LumenResult<Vec<BulkJob>>;
}
