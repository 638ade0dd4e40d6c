//! In-memory implementations of the storage ports.
//!
//! Behaviourally equivalent to the Postgres repositories for the operations the
//! sync engine relies on (natural-key upsert, conditional sync claim, metadata
//! merge), so pipeline tests can run without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::bulk_jobs::models::{BulkJob, BulkJobStatus, JobCompletion};
use crate::bulk_jobs::repositories::BulkJobRepository;
use crate::connections::models::{merge_metadata, Connection, SyncStatus};
use crate::connections::repositories::ConnectionRepository;
use crate::records::models::{EntityType, Granularity, StoredRecord};
use crate::records::repositories::RecordStore;
use lumen_common::error::{LumenError, LumenResult};

type RecordKey = (Uuid, EntityType, String);

#[derive(Default)]
struct State {
    connections: HashMap<Uuid, Connection>,
    bulk_jobs: Vec<BulkJob>,
    records: BTreeMap<RecordKey, StoredRecord>,
}

/// Shared in-memory backing for all three repositories. Cloning shares state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LumenResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| LumenError::Internal("memory store lock poisoned".to_string()))
    }

    /// Mark a connection revoked, as the authorization collaborator would.
    pub fn revoke(&self, id: Uuid) -> LumenResult<()> {
        let mut state = self.lock()?;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or_else(|| LumenError::NotFound(format!("connection not found: {id}")))?;
        conn.revoked_at = Some(Utc::now());
        Ok(())
    }

    /// Delete a connection and everything it owns.
    pub fn remove_connection(&self, id: Uuid) -> LumenResult<()> {
        let mut state = self.lock()?;
        state.connections.remove(&id);
        state.bulk_jobs.retain(|j| j.connection_id != id);
        state.records.retain(|(conn, _, _), _| *conn != id);
        Ok(())
    }
}

#[async_trait]
impl ConnectionRepository for MemoryStore {
    async fn create(&self, connection: Connection) -> LumenResult<Connection> {
        let mut state = self.lock()?;
        if state.connections.contains_key(&connection.id) {
            return Err(LumenError::Conflict(format!(
                "connection already exists: {}",
                connection.id
            )));
        }
        state.connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn get(&self, id: Uuid) -> LumenResult<Option<Connection>> {
        Ok(self.lock()?.connections.get(&id).cloned())
    }

    async fn list_by_status(&self, status: SyncStatus, limit: i64) -> LumenResult<Vec<Connection>> {
        let state = self.lock()?;
        let mut found: Vec<Connection> = state
            .connections
            .values()
            .filter(|c| c.sync_status == status && !c.is_revoked())
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn list_stale_claims(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> LumenResult<Vec<Connection>> {
        let state = self.lock()?;
        let mut found: Vec<Connection> = state
            .connections
            .values()
            .filter(|c| c.sync_status.is_active() && !c.is_revoked() && c.updated_at < stale_before)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.updated_at);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn try_begin_sync(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> LumenResult<Option<Connection>> {
        let mut state = self.lock()?;
        let Some(conn) = state.connections.get_mut(&id) else {
            return Ok(None);
        };
        let abandoned = conn.sync_status.is_active() && conn.updated_at < stale_before;
        if conn.is_revoked() || !(conn.sync_status.can_start() || abandoned) {
            return Ok(None);
        }
        conn.sync_status = SyncStatus::QuickSyncRunning;
        conn.stage_metadata = serde_json::json!({ "mini_sync_completed": false });
        conn.updated_at = Utc::now();
        Ok(Some(conn.clone()))
    }

    async fn touch(&self, id: Uuid) -> LumenResult<bool> {
        let mut state = self.lock()?;
        match state.connections.get_mut(&id) {
            Some(conn) if conn.sync_status.is_active() => {
                conn.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        metadata: serde_json::Value,
    ) -> LumenResult<Connection> {
        let mut state = self.lock()?;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or_else(|| LumenError::NotFound(format!("connection not found: {id}")))?;
        if !conn.sync_status.can_transition_to(status) {
            return Err(LumenError::Conflict(format!(
                "connection {id} cannot move from {} to {status}",
                conn.sync_status
            )));
        }
        let now = Utc::now();
        conn.sync_status = status;
        merge_metadata(&mut conn.stage_metadata, &metadata);
        if status == SyncStatus::Completed {
            conn.last_synced_at = Some(now);
        }
        conn.updated_at = now;
        Ok(conn.clone())
    }
}

#[async_trait]
impl BulkJobRepository for MemoryStore {
    async fn create(&self, job: BulkJob) -> LumenResult<BulkJob> {
        let mut state = self.lock()?;
        if !state.connections.contains_key(&job.connection_id) {
            return Err(LumenError::NotFound(format!(
                "connection not found: {}",
                job.connection_id
            )));
        }
        state.bulk_jobs.push(job.clone());
        Ok(job)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: BulkJobStatus,
        completion: JobCompletion,
    ) -> LumenResult<BulkJob> {
        let mut state = self.lock()?;
        let job = state
            .bulk_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| LumenError::NotFound(format!("bulk job not found: {id}")))?;
        job.status = status;
        job.records_processed = completion.records_processed;
        job.records_skipped = completion.records_skipped;
        job.decode_errors = completion.decode_errors;
        job.error_message = completion.error_message;
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn list_for_connection(&self, connection_id: Uuid) -> LumenResult<Vec<BulkJob>> {
        let state = self.lock()?;
        let mut jobs: Vec<BulkJob> = state
            .bulk_jobs
            .iter()
            .filter(|j| j.connection_id == connection_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_records(&self, records: &[StoredRecord]) -> LumenResult<u64> {
        let mut state = self.lock()?;
        for r in records {
            if !state.connections.contains_key(&r.connection_id) {
                return Err(LumenError::NotFound(format!(
                    "connection not found: {}",
                    r.connection_id
                )));
            }
        }
        for r in records {
            let key = (r.connection_id, r.entity_type, r.natural_key.clone());
            state.records.insert(key, r.clone());
        }
        Ok(records.len() as u64)
    }

    async fn granular_dates(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
        dates: &[NaiveDate],
    ) -> LumenResult<HashSet<NaiveDate>> {
        let wanted: HashSet<&NaiveDate> = dates.iter().collect();
        let state = self.lock()?;
        Ok(state
            .records
            .values()
            .filter(|r| {
                r.connection_id == connection_id
                    && r.entity_type == entity_type
                    && r.granularity == Some(Granularity::Granular)
            })
            .filter_map(|r| r.record_date)
            .filter(|d| wanted.contains(d))
            .collect())
    }

    async fn delete_aggregates(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
        dates: &[NaiveDate],
    ) -> LumenResult<u64> {
        let mut state = self.lock()?;
        let before = state.records.len();
        state.records.retain(|_, r| {
            !(r.connection_id == connection_id
                && r.entity_type == entity_type
                && r.granularity == Some(Granularity::Aggregate)
                && r.record_date.is_some_and(|d| dates.contains(&d)))
        });
        Ok((before - state.records.len()) as u64)
    }

    async fn count(&self, connection_id: Uuid, entity_type: EntityType) -> LumenResult<i64> {
        let state = self.lock()?;
        Ok(state
            .records
            .keys()
            .filter(|(c, e, _)| *c == connection_id && *e == entity_type)
            .count() as i64)
    }

    async fn list(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
    ) -> LumenResult<Vec<StoredRecord>> {
        let state = self.lock()?;
        Ok(state
            .records
            .iter()
            .filter(|((c, e, _), _)| *c == connection_id && *e == entity_type)
            .map(|(_, r)| r.clone())
            .collect())
    }
}
