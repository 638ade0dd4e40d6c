use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{postgres::PgRow, PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::records::models::{EntityType, Granularity, StoredRecord};
use crate::records::repositories::RecordStore;
use lumen_common::error::{LumenError, LumenResult};

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> LumenResult<StoredRecord> {
        let entity_raw: String = row.get("entity_type");
        let granularity_raw: Option<String> = row.get("granularity");
        let granularity = granularity_raw
            .as_deref()
            .map(Granularity::from_str)
            .transpose()
            .map_err(LumenError::Internal)?;

        Ok(StoredRecord {
            connection_id: row.get("connection_id"),
            entity_type: EntityType::from_str(&entity_raw).map_err(LumenError::Internal)?,
            natural_key: row.get("natural_key"),
            record_date: row.get("record_date"),
            granularity,
            payload: row.get("payload"),
            synced_at: row.get("synced_at"),
        })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_records(&self, records: &[StoredRecord]) -> LumenResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(
            "insert into platform_records \
             (connection_id, entity_type, natural_key, record_date, granularity, payload, synced_at) ",
        );
        qb.push_values(records, |mut b, r| {
            b.push_bind(r.connection_id)
                .push_bind(r.entity_type.as_str())
                .push_bind(&r.natural_key)
                .push_bind(r.record_date)
                .push_bind(r.granularity.map(|g| g.as_str()))
                .push_bind(&r.payload)
                .push_bind(r.synced_at);
        });
        qb.push(
            " on conflict (connection_id, entity_type, natural_key) do update set \
               record_date = excluded.record_date, \
               granularity = excluded.granularity, \
               payload = excluded.payload, \
               synced_at = excluded.synced_at",
        );

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| LumenError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn granular_dates(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
        dates: &[NaiveDate],
    ) -> LumenResult<HashSet<NaiveDate>> {
        if dates.is_empty() {
            return Ok(HashSet::new());
        }

        let found: Vec<NaiveDate> = sqlx::query_scalar(
            "select distinct record_date from platform_records
             where connection_id = $1 and entity_type = $2
               and granularity = 'granular'
               and record_date = any($3)",
        )
        .bind(connection_id)
        .bind(entity_type.as_str())
        .bind(dates)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        Ok(found.into_iter().collect())
    }

    async fn delete_aggregates(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
        dates: &[NaiveDate],
    ) -> LumenResult<u64> {
        if dates.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "delete from platform_records
             where connection_id = $1 and entity_type = $2
               and granularity = 'aggregate'
               and record_date = any($3)",
        )
        .bind(connection_id)
        .bind(entity_type.as_str())
        .bind(dates)
        .execute(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn count(&self, connection_id: Uuid, entity_type: EntityType) -> LumenResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "select count(*) from platform_records where connection_id = $1 and entity_type = $2",
        )
        .bind(connection_id)
        .bind(entity_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;
        Ok(count)
    }

    async fn list(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
    ) -> LumenResult<Vec<StoredRecord>> {
        let rows = sqlx::query(
            "select connection_id, entity_type, natural_key, record_date, granularity, payload, synced_at
             from platform_records
             where connection_id = $1 and entity_type = $2
             order by natural_key asc",
        )
        .bind(connection_id)
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }
}
