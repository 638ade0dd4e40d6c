use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::connections::models::{Connection, Platform, SyncStatus};
use crate::connections::repositories::ConnectionRepository;
use lumen_common::error::{LumenError, LumenResult};

const CONNECTION_COLUMNS: &str = "id, brand_id, platform, credential, sync_status, last_synced_at, \
     stage_metadata, revoked_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgConnectionRepository {
    pool: PgPool,
}

impl PgConnectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> LumenResult<Connection> {
        let platform_raw: String = row.get("platform");
        let status_raw: String = row.get("sync_status");

        Ok(Connection {
            id: row.get("id"),
            brand_id: row.get("brand_id"),
            platform: Platform::from_str(&platform_raw).map_err(LumenError::Internal)?,
            credential: row.get("credential"),
            sync_status: SyncStatus::from_str(&status_raw).map_err(LumenError::Internal)?,
            last_synced_at: row.get("last_synced_at"),
            stage_metadata: row.get("stage_metadata"),
            revoked_at: row.get("revoked_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl ConnectionRepository for PgConnectionRepository {
    async fn create(&self, c: Connection) -> LumenResult<Connection> {
        let row = sqlx::query(&format!(
            "insert into connections
             (id, brand_id, platform, credential, sync_status, last_synced_at,
              stage_metadata, revoked_at, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             returning {CONNECTION_COLUMNS}"
        ))
        .bind(c.id)
        .bind(c.brand_id)
        .bind(c.platform.as_str())
        .bind(&c.credential)
        .bind(c.sync_status.as_str())
        .bind(c.last_synced_at)
        .bind(&c.stage_metadata)
        .bind(c.revoked_at)
        .bind(c.created_at)
        .bind(c.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn get(&self, id: Uuid) -> LumenResult<Option<Connection>> {
        let row = sqlx::query(&format!(
            "select {CONNECTION_COLUMNS} from connections where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn list_by_status(&self, status: SyncStatus, limit: i64) -> LumenResult<Vec<Connection>> {
        let rows = sqlx::query(&format!(
            "select {CONNECTION_COLUMNS} from connections
             where sync_status = $1 and revoked_at is null
             order by created_at asc
             limit $2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }

    async fn list_stale_claims(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> LumenResult<Vec<Connection>> {
        let rows = sqlx::query(&format!(
            "select {CONNECTION_COLUMNS} from connections
             where sync_status in ('quick_sync_running', 'bulk_importing')
               and revoked_at is null
               and updated_at < $1
             order by updated_at asc
             limit $2"
        ))
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }

    async fn try_begin_sync(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> LumenResult<Option<Connection>> {
        let row = sqlx::query(&format!(
            "update connections
             set sync_status = 'quick_sync_running',
                 stage_metadata = '{{\"mini_sync_completed\": false}}'::jsonb,
                 updated_at = $1
             where id = $2
               and revoked_at is null
               and (sync_status in ('not_started', 'completed', 'failed')
                    or updated_at < $3)
             returning {CONNECTION_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn touch(&self, id: Uuid) -> LumenResult<bool> {
        let result = sqlx::query(
            "update connections
             set updated_at = $1
             where id = $2 and sync_status in ('quick_sync_running', 'bulk_importing')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        metadata: serde_json::Value,
    ) -> LumenResult<Connection> {
        let allowed: Vec<String> = status
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "update connections
             set sync_status = $1,
                 stage_metadata = stage_metadata || $2,
                 last_synced_at = case when $1 = 'completed' then $3 else last_synced_at end,
                 updated_at = $3
             where id = $4 and sync_status = any($5)
             returning {CONNECTION_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(&metadata)
        .bind(now)
        .bind(id)
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        if let Some(r) = row {
            return Self::map_row(r);
        }

        let current: Option<String> =
            sqlx::query_scalar("select sync_status from connections where id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| LumenError::Database(e.to_string()))?;
        match current {
            Some(from) => Err(LumenError::Conflict(format!(
                "connection {id} cannot move from {from} to {status}"
            ))),
            None => Err(LumenError::NotFound(format!("connection not found: {id}"))),
        }
    }
}
