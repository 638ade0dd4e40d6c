use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::records::models::{EntityType, StoredRecord};
use lumen_common::error::LumenResult;

/// Storage port for synced platform records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace by natural key. The batch must not repeat a key.
    /// Returns the number of rows written.
    async fn upsert_records(&self, records: &[StoredRecord]) -> LumenResult<u64>;

    /// Dates among `dates` that already have at least one granular row.
    async fn granular_dates(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
        dates: &[NaiveDate],
    ) -> LumenResult<HashSet<NaiveDate>>;

    /// Remove aggregate rows for `dates`. Returns the number of rows removed.
    async fn delete_aggregates(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
        dates: &[NaiveDate],
    ) -> LumenResult<u64>;

    async fn count(&self, connection_id: Uuid, entity_type: EntityType) -> LumenResult<i64>;

    /// All rows for one entity type, ordered by natural key.
    async fn list(&self, connection_id: Uuid, entity_type: EntityType)
        -> LumenResult<Vec<StoredRecord>>;
}
