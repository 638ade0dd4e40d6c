use lumen_db::bulk_jobs::models::BulkJob;
use lumen_db::connections::models::{SyncStatus, SyncStatusView};
use lumen_sync::controller::QuickSyncReport;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct SyncStartedResponse {
    pub connection_id: Uuid,
    pub status: SyncStatus,
    pub quick_sync: QuickSyncReport,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub data: SyncStatusView,
}

#[derive(Debug, Serialize)]
pub struct BulkJobsResponse {
    pub data: Vec<BulkJob>,
    pub count: usize,
}
