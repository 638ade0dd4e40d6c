use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use lumen_common::error::LumenError;
use lumen_db::connections::models::SyncStatus;
use uuid::Uuid;

use crate::error::ApiError;
use crate::sync::responses::{BulkJobsResponse, SyncStartedResponse, SyncStatusResponse};
use crate::AppState;

/// Run quick sync inline and hand the historical import to the background.
pub async fn start_sync(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SyncStartedResponse>), ApiError> {
    let handle = state.controller.start_sync(id).await?;

    // Dropping the join handle detaches the import from this request.
    let response = SyncStartedResponse {
        connection_id: handle.connection_id,
        status: SyncStatus::BulkImporting,
        quick_sync: handle.quick_sync,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn get_sync_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncStatusResponse>, ApiError> {
    let data = state.controller.get_sync_status(id).await?;
    Ok(Json(SyncStatusResponse { data }))
}

pub async fn list_bulk_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BulkJobsResponse>, ApiError> {
    if state.connections.get(id).await?.is_none() {
        return Err(LumenError::NotFound(format!("connection not found: {id}")).into());
    }
    let data = state.jobs.list_for_connection(id).await?;
    let count = data.len();
    Ok(Json(BulkJobsResponse { data, count }))
}
