use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use lumen_common::error::LumenError;
use lumen_db::bulk_jobs::models::{BulkJob, BulkJobStatus, InvalidTransition, JobCompletion};
use lumen_db::connections::models::Connection;
use lumen_db::records::models::EntityType;

use crate::config::PollSettings;
use crate::fetcher::{Classification, FetchError};
use crate::ndjson::LineSplitter;
use crate::platform::ExportStatus;
use crate::ports::SyncPorts;
use crate::records::{decode_line, FetchedRecord};
use crate::writer::{IdempotentWriter, WriteOutcome};

/// Decode failures beyond this many per job are logged at debug level only.
const LOGGED_DECODE_ERRORS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum BulkJobError {
    #[error("export submission failed: {0}")]
    Submit(FetchError),

    #[error("export status poll failed: {0}")]
    Poll(FetchError),

    #[error("export download failed: {0}")]
    Download(FetchError),

    #[error("export job ended {status} (error code: {})", error_code.as_deref().unwrap_or("none"))]
    JobFailed {
        status: BulkJobStatus,
        error_code: Option<String>,
    },

    #[error("completed export has no result url")]
    MissingResult,

    #[error("export job not terminal after {0:?}")]
    PollTimeout(Duration),

    #[error("connection {0} was revoked or deleted")]
    ConnectionGone(Uuid),

    #[error("storage error: {0}")]
    Storage(LumenError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// Terminal result of one entity type's export, for aggregation by the controller.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub entity_type: EntityType,
    pub job_id: Option<Uuid>,
    pub status: BulkJobStatus,
    pub records_processed: i64,
    pub records_skipped: i64,
    pub decode_errors: i64,
    pub error: Option<String>,
    pub connection_gone: bool,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == BulkJobStatus::Completed && self.error.is_none()
    }

    /// A job task that never reported back.
    pub fn lost(entity_type: EntityType, reason: impl Into<String>) -> Self {
        Self {
            entity_type,
            job_id: None,
            status: BulkJobStatus::Failed,
            records_processed: 0,
            records_skipped: 0,
            decode_errors: 0,
            error: Some(reason.into()),
            connection_gone: false,
        }
    }
}

/// Running tally while an export body is ingested.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessingProgress {
    pub lines: i64,
    pub decode_errors: i64,
    pub write: WriteOutcome,
}

impl ProcessingProgress {
    fn completion(&self, error_message: Option<String>) -> JobCompletion {
        JobCompletion {
            records_processed: self.write.written as i64,
            records_skipped: self.write.skipped() as i64,
            decode_errors: self.decode_errors,
            error_message,
        }
    }
}

/// Drives one vendor bulk export from submission to stored records.
pub struct BulkJobOrchestrator {
    ports: SyncPorts,
    writer: IdempotentWriter,
    connection_id: Uuid,
    credential: String,
    poll: PollSettings,
    write_batch_size: usize,
    download_attempts: u32,
}

impl BulkJobOrchestrator {
    pub fn new(
        ports: SyncPorts,
        connection: &Connection,
        poll: PollSettings,
        write_batch_size: usize,
    ) -> Self {
        let write_batch_size = write_batch_size.max(1);
        Self {
            writer: IdempotentWriter::new(ports.records.clone(), write_batch_size),
            ports,
            connection_id: connection.id,
            credential: connection.credential.clone(),
            poll,
            write_batch_size,
            download_attempts: 3,
        }
    }

    /// How many times an export body is requested before a broken stream
    /// fails the job. Later requests skip the lines already taken.
    pub fn with_download_attempts(mut self, attempts: u32) -> Self {
        self.download_attempts = attempts.max(1);
        self
    }

    /// Submit, poll and process one export. Never fails: every error becomes
    /// part of the returned outcome and of the audit row when one exists.
    pub async fn run(&self, entity_type: EntityType) -> JobOutcome {
        let mut job = match self.submit(entity_type).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(
                    connection_id = %self.connection_id,
                    %entity_type,
                    error = %e,
                    "bulk export submission failed"
                );
                let mut outcome = JobOutcome::lost(entity_type, e.to_string());
                outcome.connection_gone = matches!(e, BulkJobError::ConnectionGone(_));
                return outcome;
            }
        };

        let result = self.poll_and_process(&mut job).await;

        let connection_gone = matches!(result, Err(BulkJobError::ConnectionGone(_)));
        match &result {
            Ok(_) => tracing::info!(
                connection_id = %self.connection_id,
                %entity_type,
                job_id = %job.id,
                records_processed = job.records_processed,
                records_skipped = job.records_skipped,
                decode_errors = job.decode_errors,
                "bulk export completed"
            ),
            Err(e) => tracing::error!(
                connection_id = %self.connection_id,
                %entity_type,
                job_id = %job.id,
                error = %e,
                "bulk export failed"
            ),
        }

        JobOutcome {
            entity_type,
            job_id: Some(job.id),
            status: job.status,
            records_processed: job.records_processed,
            records_skipped: job.records_skipped,
            decode_errors: job.decode_errors,
            error: result.err().map(|e| e.to_string()),
            connection_gone,
        }
    }

    /// Start a remote export and record it as running. A vendor that reports
    /// the job as merely queued is still treated as running from here on.
    pub async fn submit(&self, entity_type: EntityType) -> Result<BulkJob, BulkJobError> {
        self.ensure_connection().await?;

        let submitted = self
            .ports
            .api
            .submit_export(&self.credential, entity_type)
            .await
            .map_err(|e| self.classify_fetch(e, BulkJobError::Submit))?;

        let job = BulkJob::submitted(self.connection_id, entity_type, submitted.job_id);
        let job = self
            .ports
            .jobs
            .create(job)
            .await
            .map_err(|e| self.classify_storage(e))?;

        tracing::info!(
            connection_id = %self.connection_id,
            %entity_type,
            job_id = %job.id,
            remote_job_id = %job.remote_job_id,
            "bulk export submitted"
        );
        Ok(job)
    }

    /// Poll until the remote job is terminal, the connection disappears, or
    /// the poll timeout elapses. Returns the terminal remote report.
    ///
    /// Non-terminal progress is tracked on `job.status`; the terminal state is
    /// left for the caller to record.
    pub async fn poll_until_terminal(
        &self,
        job: &mut BulkJob,
    ) -> Result<(BulkJobStatus, ExportStatus), BulkJobError> {
        let deadline = Instant::now() + self.poll.timeout;
        let mut polls: u32 = 0;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(BulkJobError::PollTimeout(self.poll.timeout));
            }
            polls += 1;
            tokio::time::sleep(self.poll.delay_for(polls).min(deadline - now)).await;

            self.ensure_connection().await?;

            let report = match self
                .ports
                .api
                .export_status(&self.credential, &job.remote_job_id)
                .await
            {
                Ok(report) => report,
                Err(e) if e.is_auth_failure() => {
                    return Err(BulkJobError::ConnectionGone(self.connection_id))
                }
                Err(e) if e.classification() == Classification::Permanent => {
                    return Err(BulkJobError::Poll(e))
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        poll = polls,
                        error = %e,
                        "export status poll failed, will poll again"
                    );
                    continue;
                }
            };

            match BulkJobStatus::from_remote(&report.status) {
                None => {
                    tracing::warn!(
                        job_id = %job.id,
                        remote_status = %report.status,
                        "unrecognised export status, treating as running"
                    );
                }
                // Queued and running look the same from here.
                Some(BulkJobStatus::Created) => {}
                Some(next) => {
                    let state = job.status.transition(next)?;
                    if state.is_terminal() {
                        tracing::debug!(job_id = %job.id, polls, status = %state, "export terminal");
                        return Ok((state, report));
                    }
                    job.status = state;
                }
            }
        }
    }

    /// Stream the finished export into storage and record the final counts.
    ///
    /// Malformed lines are counted and skipped. Records written before a
    /// failure are kept.
    pub async fn process_completed_job(
        &self,
        job: &mut BulkJob,
        result_url: &str,
    ) -> Result<(), BulkJobError> {
        let mut progress = ProcessingProgress::default();
        match self.ingest(job, result_url, &mut progress).await {
            Ok(()) => {
                self.record_terminal(job, BulkJobStatus::Completed, progress.completion(None))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.record_terminal(
                    job,
                    BulkJobStatus::Failed,
                    progress.completion(Some(e.to_string())),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn poll_and_process(&self, job: &mut BulkJob) -> Result<(), BulkJobError> {
        let (remote, report) = match self.poll_until_terminal(job).await {
            Ok(terminal) => terminal,
            Err(e) => return self.fail(job, e).await,
        };

        if remote != BulkJobStatus::Completed {
            let err = BulkJobError::JobFailed {
                status: remote,
                error_code: report.error_code,
            };
            let completion = JobCompletion {
                error_message: Some(err.to_string()),
                ..Default::default()
            };
            self.record_terminal(job, remote, completion).await;
            return Err(err);
        }

        match report.result_url.filter(|u| !u.is_empty()) {
            Some(url) => self.process_completed_job(job, &url).await,
            None => self.fail(job, BulkJobError::MissingResult).await,
        }
    }

    async fn fail(&self, job: &mut BulkJob, err: BulkJobError) -> Result<(), BulkJobError> {
        let completion = JobCompletion {
            error_message: Some(err.to_string()),
            ..Default::default()
        };
        self.record_terminal(job, BulkJobStatus::Failed, completion).await;
        Err(err)
    }

    /// Download and store the export, re-requesting the body when the stream
    /// breaks. Each retry skips the `progress.lines` lines already taken.
    async fn ingest(
        &self,
        job: &BulkJob,
        result_url: &str,
        progress: &mut ProcessingProgress,
    ) -> Result<(), BulkJobError> {
        let mut attempt = 1;
        loop {
            match self.ingest_once(job, result_url, progress).await {
                Err(BulkJobError::Download(e))
                    if attempt < self.download_attempts
                        && e.classification() != Classification::Permanent =>
                {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt,
                        resume_at_line = progress.lines,
                        error = %e,
                        "export download broke, resuming"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.poll.interval).await;
                }
                other => return other,
            }
        }
    }

    async fn ingest_once(
        &self,
        job: &BulkJob,
        result_url: &str,
        progress: &mut ProcessingProgress,
    ) -> Result<(), BulkJobError> {
        let mut body = self
            .ports
            .api
            .download_export(&self.credential, result_url)
            .await
            .map_err(|e| self.classify_fetch(e, BulkJobError::Download))?;

        let skip = progress.lines;
        let mut seen: i64 = 0;
        let mut splitter = LineSplitter::new();
        let mut buffer: Vec<FetchedRecord> = Vec::with_capacity(self.write_batch_size);

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Keep what was read; a resumed download starts after it.
                    self.flush(&mut buffer, progress).await?;
                    return Err(self.classify_fetch(e, BulkJobError::Download));
                }
            };
            for line in splitter.push(&chunk) {
                seen += 1;
                if seen <= skip {
                    continue;
                }
                self.accept_line(job, &line, &mut buffer, progress);
                if buffer.len() >= self.write_batch_size {
                    self.flush(&mut buffer, progress).await?;
                }
            }
        }
        if let Some(line) = splitter.finish() {
            seen += 1;
            if seen > skip {
                self.accept_line(job, &line, &mut buffer, progress);
            }
        }
        self.flush(&mut buffer, progress).await
    }

    fn accept_line(
        &self,
        job: &BulkJob,
        line: &[u8],
        buffer: &mut Vec<FetchedRecord>,
        progress: &mut ProcessingProgress,
    ) {
        progress.lines += 1;
        match decode_line(job.entity_type, line) {
            Ok(record) => buffer.push(record),
            Err(e) => {
                progress.decode_errors += 1;
                if progress.decode_errors <= LOGGED_DECODE_ERRORS {
                    tracing::warn!(job_id = %job.id, line = progress.lines, error = %e, "skipping malformed export line");
                } else {
                    tracing::debug!(job_id = %job.id, line = progress.lines, error = %e, "skipping malformed export line");
                }
            }
        }
    }

    async fn flush(
        &self,
        buffer: &mut Vec<FetchedRecord>,
        progress: &mut ProcessingProgress,
    ) -> Result<(), BulkJobError> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.ensure_connection().await?;
        let outcome = self
            .writer
            .upsert_batch(self.connection_id, std::mem::take(buffer))
            .await
            .map_err(|e| self.classify_storage(e))?;
        progress.write.merge(outcome);
        Ok(())
    }

    /// Persist a terminal state. The row may already be gone with its
    /// connection, so failures here are logged rather than propagated.
    async fn record_terminal(
        &self,
        job: &mut BulkJob,
        status: BulkJobStatus,
        completion: JobCompletion,
    ) {
        if let Err(e) = job.status.transition(status) {
            tracing::warn!(job_id = %job.id, error = %e, "unexpected bulk job transition");
        }
        job.status = status;
        job.records_processed = completion.records_processed;
        job.records_skipped = completion.records_skipped;
        job.decode_errors = completion.decode_errors;
        job.error_message = completion.error_message.clone();

        match self.ports.jobs.finish(job.id, status, completion).await {
            Ok(row) => *job = row,
            Err(e) => tracing::warn!(job_id = %job.id, error = %e, "could not record bulk job outcome"),
        }
    }

    async fn ensure_connection(&self) -> Result<(), BulkJobError> {
        match self.ports.connections.get(self.connection_id).await {
            Ok(Some(conn)) if !conn.is_revoked() => Ok(()),
            Ok(_) => Err(BulkJobError::ConnectionGone(self.connection_id)),
            Err(e) => Err(BulkJobError::Storage(e)),
        }
    }

    fn classify_fetch(&self, e: FetchError, wrap: fn(FetchError) -> BulkJobError) -> BulkJobError {
        if e.is_auth_failure() {
            BulkJobError::ConnectionGone(self.connection_id)
        } else {
            wrap(e)
        }
    }

    /// Writes against a deleted connection surface as `NotFound`.
    fn classify_storage(&self, e: LumenError) -> BulkJobError {
        match e {
            LumenError::NotFound(_) => BulkJobError::ConnectionGone(self.connection_id),
            other => BulkJobError::Storage(other),
        }
    }
}
