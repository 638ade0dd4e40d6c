use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::connections::models::{Connection, SyncStatus};
use lumen_common::error::LumenResult;

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn create(&self, connection: Connection) -> LumenResult<Connection>;

    async fn get(&self, id: Uuid) -> LumenResult<Option<Connection>>;

    async fn list_by_status(&self, status: SyncStatus, limit: i64) -> LumenResult<Vec<Connection>>;

    /// Active, non-revoked connections whose claim has not been refreshed
    /// since `stale_before`. Oldest first.
    async fn list_stale_claims(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> LumenResult<Vec<Connection>>;

    /// Atomically move a non-revoked connection into `QuickSyncRunning` and
    /// reset its stage metadata. Idle connections are always claimable; an
    /// active one only when its `updated_at` is older than `stale_before`.
    /// Returns `None` if the connection is missing, revoked, or held by a live
    /// sync.
    async fn try_begin_sync(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> LumenResult<Option<Connection>>;

    /// Refresh `updated_at` on an active claim. Returns `false` when the
    /// connection is no longer active.
    async fn touch(&self, id: Uuid) -> LumenResult<bool>;

    /// Set the sync status and shallow-merge `metadata` into the stage metadata.
    /// Moving to `Completed` stamps `last_synced_at`.
    ///
    /// Fails with `Conflict` when the current status cannot move to `status`
    /// and `NotFound` when the connection is gone.
    async fn update_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        metadata: serde_json::Value,
    ) -> LumenResult<Connection>;
}
