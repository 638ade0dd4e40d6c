use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::bulk_jobs::models::{BulkJob, BulkJobStatus, JobCompletion};
use crate::bulk_jobs::repositories::BulkJobRepository;
use crate::records::models::EntityType;
use lumen_common::error::{LumenError, LumenResult};

const BULK_JOB_COLUMNS: &str = "id, connection_id, remote_job_id, entity_type, status, \
     records_processed, records_skipped, decode_errors, error_message, created_at, completed_at";

#[derive(Clone)]
pub struct PgBulkJobRepository {
    pool: PgPool,
}

impl PgBulkJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> LumenResult<BulkJob> {
        let entity_raw: String = row.get("entity_type");
        let status_raw: String = row.get("status");

        Ok(BulkJob {
            id: row.get("id"),
            connection_id: row.get("connection_id"),
            remote_job_id: row.get("remote_job_id"),
            entity_type: EntityType::from_str(&entity_raw).map_err(LumenError::Internal)?,
            status: BulkJobStatus::from_str(&status_raw).map_err(LumenError::Internal)?,
            records_processed: row.get("records_processed"),
            records_skipped: row.get("records_skipped"),
            decode_errors: row.get("decode_errors"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[async_trait]
impl BulkJobRepository for PgBulkJobRepository {
    async fn create(&self, job: BulkJob) -> LumenResult<BulkJob> {
        let row = sqlx::query(&format!(
            "insert into bulk_jobs
             (id, connection_id, remote_job_id, entity_type, status, records_processed,
              records_skipped, decode_errors, error_message, created_at, completed_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             returning {BULK_JOB_COLUMNS}"
        ))
        .bind(job.id)
        .bind(job.connection_id)
        .bind(&job.remote_job_id)
        .bind(job.entity_type.as_str())
        .bind(job.status.as_str())
        .bind(job.records_processed)
        .bind(job.records_skipped)
        .bind(job.decode_errors)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.completed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: BulkJobStatus,
        completion: JobCompletion,
    ) -> LumenResult<BulkJob> {
        let row = sqlx::query(&format!(
            "update bulk_jobs
             set status = $1, records_processed = $2, records_skipped = $3,
                 decode_errors = $4, error_message = $5, completed_at = $6
             where id = $7
             returning {BULK_JOB_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(completion.records_processed)
        .bind(completion.records_skipped)
        .bind(completion.decode_errors)
        .bind(&completion.error_message)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        match row {
            Some(r) => Self::map_row(r),
            None => Err(LumenError::NotFound(format!("bulk job not found: {id}"))),
        }
    }

    async fn list_for_connection(&self, connection_id: Uuid) -> LumenResult<Vec<BulkJob>> {
        let rows = sqlx::query(&format!(
            "select {BULK_JOB_COLUMNS} from bulk_jobs
             where connection_id = $1
             order by created_at desc"
        ))
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }
}
