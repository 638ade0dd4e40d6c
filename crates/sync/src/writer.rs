use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use lumen_common::error::LumenResult;
use lumen_db::records::models::{EntityType, Granularity, StoredRecord};
use lumen_db::records::repositories::RecordStore;

use crate::records::FetchedRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub written: u64,
    pub skipped_duplicate: u64,
    pub skipped_dominated: u64,
    pub aggregates_superseded: u64,
}

impl WriteOutcome {
    pub fn merge(&mut self, other: WriteOutcome) {
        self.written += other.written;
        self.skipped_duplicate += other.skipped_duplicate;
        self.skipped_dominated += other.skipped_dominated;
        self.aggregates_superseded += other.aggregates_superseded;
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_duplicate + self.skipped_dominated
    }
}

/// Upserts records by natural key so replays from quick sync, bulk import or
/// retries never duplicate a row.
///
/// For time-series entities a granular row for a date dominates: aggregate
/// rows for that date are neither written nor kept.
#[derive(Clone)]
pub struct IdempotentWriter {
    store: Arc<dyn RecordStore>,
    chunk_size: usize,
}

impl IdempotentWriter {
    pub fn new(store: Arc<dyn RecordStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn upsert_batch(
        &self,
        connection_id: Uuid,
        records: Vec<FetchedRecord>,
    ) -> LumenResult<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let mut by_entity: BTreeMap<EntityType, Vec<FetchedRecord>> = BTreeMap::new();
        for record in records {
            by_entity.entry(record.entity_type).or_default().push(record);
        }

        for (entity_type, group) in by_entity {
            let (unique, duplicates) = dedupe_last_wins(group);
            outcome.skipped_duplicate += duplicates;
            outcome.merge(self.write_entity(connection_id, entity_type, unique).await?);
        }

        tracing::debug!(
            %connection_id,
            written = outcome.written,
            skipped_duplicate = outcome.skipped_duplicate,
            skipped_dominated = outcome.skipped_dominated,
            aggregates_superseded = outcome.aggregates_superseded,
            "batch upserted"
        );
        Ok(outcome)
    }

    async fn write_entity(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
        records: Vec<FetchedRecord>,
    ) -> LumenResult<WriteOutcome> {
        let mut outcome = WriteOutcome::default();

        let mut aggregates = Vec::new();
        let mut rest = Vec::new();
        for record in records {
            match (record.granularity, record.key.date) {
                (Some(Granularity::Aggregate), Some(_)) => aggregates.push(record),
                _ => rest.push(record),
            }
        }

        let batch_granular: BTreeSet<NaiveDate> = rest
            .iter()
            .filter(|r| r.granularity == Some(Granularity::Granular))
            .filter_map(|r| r.key.date)
            .collect();

        if !aggregates.is_empty() {
            let candidate_dates: Vec<NaiveDate> = aggregates
                .iter()
                .filter_map(|r| r.key.date)
                .filter(|d| !batch_granular.contains(d))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let stored_granular = if candidate_dates.is_empty() {
                Default::default()
            } else {
                self.store
                    .granular_dates(connection_id, entity_type, &candidate_dates)
                    .await?
            };

            let before = aggregates.len();
            aggregates.retain(|r| {
                r.key
                    .date
                    .is_some_and(|d| !batch_granular.contains(&d) && !stored_granular.contains(&d))
            });
            outcome.skipped_dominated = (before - aggregates.len()) as u64;
        }

        let synced_at = Utc::now();
        let rows: Vec<StoredRecord> = rest
            .into_iter()
            .map(|r| r.into_stored(connection_id, synced_at))
            .collect();
        outcome.written += self.upsert_chunked(&rows).await?;

        if !batch_granular.is_empty() {
            let dates: Vec<NaiveDate> = batch_granular.into_iter().collect();
            outcome.aggregates_superseded = self
                .store
                .delete_aggregates(connection_id, entity_type, &dates)
                .await?;
        }

        let rows: Vec<StoredRecord> = aggregates
            .into_iter()
            .map(|r| r.into_stored(connection_id, synced_at))
            .collect();
        outcome.written += self.upsert_chunked(&rows).await?;

        Ok(outcome)
    }

    async fn upsert_chunked(&self, rows: &[StoredRecord]) -> LumenResult<u64> {
        let mut written = 0;
        for chunk in rows.chunks(self.chunk_size) {
            written += self.store.upsert_records(chunk).await?;
        }
        Ok(written)
    }
}

/// Keep the last occurrence of each natural key, preserving arrival order.
fn dedupe_last_wins(records: Vec<FetchedRecord>) -> (Vec<FetchedRecord>, u64) {
    let mut slots: Vec<Option<FetchedRecord>> = Vec::with_capacity(records.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut duplicates = 0;

    for record in records {
        let key = record.key.encode();
        if let Some(previous) = index.insert(key, slots.len()) {
            slots[previous] = None;
            duplicates += 1;
        }
        slots.push(Some(record));
    }
    (slots.into_iter().flatten().collect(), duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_db::memory::MemoryStore;
    use serde_json::json;

    use crate::records::decode;

    fn order(id: &str, total: &str) -> FetchedRecord {
        decode(EntityType::Orders, json!({"id": id, "total_price": total})).unwrap()
    }

    fn insight(date: &str, level: &str, id: &str) -> FetchedRecord {
        let mut raw = json!({"date_start": date, "level": level, "account_id": "act_1"});
        match level {
            "ad" => raw["ad_id"] = json!(id),
            "adset" => raw["adset_id"] = json!(id),
            "campaign" => raw["campaign_id"] = json!(id),
            _ => {}
        }
        decode(EntityType::AdInsights, raw).unwrap()
    }

    fn setup() -> (MemoryStore, IdempotentWriter) {
        let store = MemoryStore::new();
        let writer = IdempotentWriter::new(Arc::new(store.clone()), 2);
        (store, writer)
    }

    async fn seed_connection(store: &MemoryStore) -> Uuid {
        use lumen_db::connections::models::{Connection, Platform};
        use lumen_db::connections::repositories::ConnectionRepository;
        let conn = Connection::new(Uuid::new_v4(), Platform::Shopify, "tok");
        ConnectionRepository::create(store, conn).await.unwrap().id
    }

    #[tokio::test]
    async fn replaying_a_batch_is_idempotent() {
        let (store, writer) = setup();
        let conn = seed_connection(&store).await;
        let batch = vec![order("1", "10"), order("2", "20"), order("3", "30")];

        writer.upsert_batch(conn, batch.clone()).await.unwrap();
        let first = store.list(conn, EntityType::Orders).await.unwrap();
        writer.upsert_batch(conn, batch).await.unwrap();
        let second = store.list(conn, EntityType::Orders).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        let payloads = |rows: &[StoredRecord]| rows.iter().map(|r| r.payload.clone()).collect::<Vec<_>>();
        assert_eq!(payloads(&first), payloads(&second));
    }

    #[tokio::test]
    async fn overlapping_batches_union_with_later_payload_winning() {
        let (store, writer) = setup();
        let conn = seed_connection(&store).await;

        writer
            .upsert_batch(conn, vec![order("A", "1"), order("B", "2")])
            .await
            .unwrap();
        writer
            .upsert_batch(conn, vec![order("B", "5"), order("C", "3")])
            .await
            .unwrap();

        let rows = store.list(conn, EntityType::Orders).await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        assert_eq!(rows[1].payload["total_price"], "5");
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_keep_the_last() {
        let (store, writer) = setup();
        let conn = seed_connection(&store).await;

        let outcome = writer
            .upsert_batch(conn, vec![order("A", "1"), order("A", "2"), order("B", "3")])
            .await
            .unwrap();

        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.skipped_duplicate, 1);
        let rows = store.list(conn, EntityType::Orders).await.unwrap();
        assert_eq!(rows[0].payload["total_price"], "2");
    }

    #[tokio::test]
    async fn aggregate_skipped_when_granular_in_same_batch() {
        let (store, writer) = setup();
        let conn = seed_connection(&store).await;

        let outcome = writer
            .upsert_batch(
                conn,
                vec![
                    insight("2026-03-01", "account", "act_1"),
                    insight("2026-03-01", "ad", "ad_9"),
                    insight("2026-03-02", "account", "act_1"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome.skipped_dominated, 1);
        let rows = store.list(conn, EntityType::AdInsights).await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["2026-03-01:ad_9", "2026-03-02:act_1"]);
    }

    #[tokio::test]
    async fn aggregate_skipped_when_granular_already_stored() {
        let (store, writer) = setup();
        let conn = seed_connection(&store).await;

        writer
            .upsert_batch(conn, vec![insight("2026-03-01", "ad", "ad_9")])
            .await
            .unwrap();
        let outcome = writer
            .upsert_batch(conn, vec![insight("2026-03-01", "account", "act_1")])
            .await
            .unwrap();

        assert_eq!(outcome.written, 0);
        assert_eq!(outcome.skipped_dominated, 1);
        assert_eq!(store.count(conn, EntityType::AdInsights).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn late_granular_rows_supersede_stored_aggregates() {
        let (store, writer) = setup();
        let conn = seed_connection(&store).await;

        writer
            .upsert_batch(conn, vec![insight("2026-03-01", "account", "act_1")])
            .await
            .unwrap();
        let outcome = writer
            .upsert_batch(
                conn,
                vec![insight("2026-03-01", "ad", "ad_1"), insight("2026-03-01", "ad", "ad_2")],
            )
            .await
            .unwrap();

        assert_eq!(outcome.aggregates_superseded, 1);
        let rows = store.list(conn, EntityType::AdInsights).await.unwrap();
        assert!(rows.iter().all(|r| r.granularity == Some(Granularity::Granular)));
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn mixed_level_feed_keeps_only_ad_rows() {
        let (store, writer) = setup();
        let conn = seed_connection(&store).await;

        let outcome = writer
            .upsert_batch(
                conn,
                vec![
                    insight("2026-03-01", "account", "act_1"),
                    insight("2026-03-01", "campaign", "c1"),
                    insight("2026-03-01", "adset", "s1"),
                    insight("2026-03-01", "ad", "ad_1"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.skipped_dominated, 3);
        let rows = store.list(conn, EntityType::AdInsights).await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["2026-03-01:ad_1"]);
    }

    /// Delegates to a memory store and counts upsert calls.
    struct CountingStore {
        inner: MemoryStore,
        upserts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RecordStore for CountingStore {
        async fn upsert_records(&self, records: &[StoredRecord]) -> LumenResult<u64> {
            self.upserts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.upsert_records(records).await
        }

        async fn granular_dates(
            &self,
            connection_id: Uuid,
            entity_type: EntityType,
            dates: &[NaiveDate],
        ) -> LumenResult<std::collections::HashSet<NaiveDate>> {
            self.inner.granular_dates(connection_id, entity_type, dates).await
        }

        async fn delete_aggregates(
            &self,
            connection_id: Uuid,
            entity_type: EntityType,
            dates: &[NaiveDate],
        ) -> LumenResult<u64> {
            self.inner.delete_aggregates(connection_id, entity_type, dates).await
        }

        async fn count(&self, connection_id: Uuid, entity_type: EntityType) -> LumenResult<i64> {
            self.inner.count(connection_id, entity_type).await
        }

        async fn list(
            &self,
            connection_id: Uuid,
            entity_type: EntityType,
        ) -> LumenResult<Vec<StoredRecord>> {
            self.inner.list(connection_id, entity_type).await
        }
    }

    #[tokio::test]
    async fn large_batches_are_chunked() {
        let inner = MemoryStore::new();
        let conn = seed_connection(&inner).await;
        let store = Arc::new(CountingStore {
            inner: inner.clone(),
            upserts: Default::default(),
        });
        let writer = IdempotentWriter::new(store.clone(), 2);
        let batch: Vec<FetchedRecord> = (0..5).map(|i| order(&i.to_string(), "1")).collect();

        let outcome = writer.upsert_batch(conn, batch).await.unwrap();

        assert_eq!(outcome.written, 5);
        assert_eq!(store.upserts.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(inner.count(conn, EntityType::Orders).await.unwrap(), 5);
    }

    #[test]
    fn outcomes_merge() {
        let mut total = WriteOutcome {
            written: 2,
            skipped_duplicate: 1,
            ..Default::default()
        };
        total.merge(WriteOutcome {
            written: 3,
            skipped_dominated: 2,
            ..Default::default()
        });
        assert_eq!(total.written, 5);
        assert_eq!(total.skipped(), 3);
    }
}
