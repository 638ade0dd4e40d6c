use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use lumen_common::error::LumenError;
use lumen_db::connections::models::{Connection, Platform, SyncStatus, SyncStatusView};
use lumen_db::records::models::EntityType;

use crate::bulk::{BulkJobOrchestrator, JobOutcome};
use crate::config::{SyncSettings, QUICK_WINDOW_DAYS};
use crate::fetcher::FetchError;
use crate::pagination::{PageEvent, PaginatedCollector, StopReason};
use crate::platform::PageRequest;
use crate::ports::SyncPorts;
use crate::writer::{IdempotentWriter, WriteOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync already in progress for connection {connection_id} ({status})")]
    AlreadyRunning {
        connection_id: Uuid,
        status: SyncStatus,
    },

    #[error("connection not found: {0}")]
    NotFound(Uuid),

    #[error("quick sync failed: {0}")]
    QuickSyncFailed(FetchError),

    #[error("storage error: {0}")]
    Storage(#[from] LumenError),

    /// The task running quick sync died before reporting.
    #[error("sync interrupted: {0}")]
    Interrupted(String),
}

impl SyncError {
    /// Value recorded as `quick_sync_stopped` when a claimed sync is abandoned.
    pub fn stop_label(&self) -> &'static str {
        match self {
            Self::QuickSyncFailed(_) => "fetch_failed",
            Self::Storage(_) => "storage_error",
            Self::Interrupted(_) => "interrupted",
            Self::AlreadyRunning { .. } | Self::NotFound(_) => "not_started",
        }
    }
}

/// Entity types exported during the historical import.
pub fn import_entity_types(platform: Platform) -> &'static [EntityType] {
    match platform {
        Platform::Shopify => &[EntityType::Orders, EntityType::Customers, EntityType::Products],
        Platform::MetaAds => &[EntityType::AdInsights],
    }
}

/// Entity types fetched for immediate feedback.
pub fn quick_sync_entity_types(platform: Platform) -> &'static [EntityType] {
    match platform {
        Platform::Shopify => &[EntityType::Orders],
        Platform::MetaAds => &[EntityType::AdInsights],
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityQuickSync {
    pub entity_type: EntityType,
    pub pages: usize,
    pub records: usize,
    pub decode_errors: usize,
    /// `None` when the time budget ran out mid-walk.
    pub stopped: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QuickSyncReport {
    pub entities: Vec<EntityQuickSync>,
    pub write: WriteOutcome,
    pub timed_out: bool,
}

impl QuickSyncReport {
    pub fn records_fetched(&self) -> usize {
        self.entities.iter().map(|e| e.records).sum()
    }

    /// Why the walk ended: `timed_out`, else the first non-exhausted stop.
    pub fn stop_label(&self) -> &'static str {
        if self.timed_out {
            return "timed_out";
        }
        self.entities
            .iter()
            .filter_map(|e| e.stopped)
            .find(|s| *s != "exhausted")
            .unwrap_or("exhausted")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub connection_id: Uuid,
    pub final_status: SyncStatus,
    pub jobs: Vec<JobOutcome>,
}

impl ImportReport {
    pub fn failed_jobs(&self) -> usize {
        self.jobs.iter().filter(|j| !j.succeeded()).count()
    }
}

/// Returned once quick sync is done; the historical import keeps running.
#[derive(Debug)]
pub struct SyncHandle {
    pub connection_id: Uuid,
    pub quick_sync: QuickSyncReport,
    pub import: JoinHandle<ImportReport>,
}

/// Runs the two-phase onboarding sync for a connection.
///
/// Connections are independent; the only state shared between them is the
/// credential limiter inside the platform client.
#[derive(Clone)]
pub struct ConnectionSyncController {
    ports: SyncPorts,
    settings: Arc<SyncSettings>,
}

impl ConnectionSyncController {
    pub fn new(ports: SyncPorts, settings: SyncSettings) -> Self {
        Self {
            ports,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Claim the connection, run quick sync, then detach the historical
    /// import.
    ///
    /// Everything after the claim runs on its own task, so dropping this
    /// future (a client disconnect, a handler timeout) never leaves the
    /// connection stuck in `QuickSyncRunning`. A claim whose owner died
    /// outright is taken over once its lease runs out.
    pub async fn start_sync(&self, connection_id: Uuid) -> Result<SyncHandle, SyncError> {
        let Some(connection) = self
            .ports
            .connections
            .try_begin_sync(connection_id, self.stale_before())
            .await?
        else {
            return Err(self.rejection(connection_id).await?);
        };
        tracing::info!(%connection_id, platform = connection.platform.as_str(), "quick sync started");

        let this = self.clone();
        match tokio::spawn(async move { this.quick_sync_then_import(connection).await }).await {
            Ok(result) => result,
            Err(e) => {
                let err = SyncError::Interrupted(e.to_string());
                tracing::error!(%connection_id, error = %err, "quick sync task died");
                self.mark_failed(connection_id, &err).await;
                Err(err)
            }
        }
    }

    async fn quick_sync_then_import(self, connection: Connection) -> Result<SyncHandle, SyncError> {
        let connection_id = connection.id;
        let quick_sync = match self.run_quick_sync(&connection).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(%connection_id, error = %e, "quick sync failed");
                self.mark_failed(connection_id, &e).await;
                return Err(e);
            }
        };

        let advanced = self
            .ports
            .connections
            .update_status(
                connection_id,
                SyncStatus::BulkImporting,
                json!({
                    "mini_sync_completed": true,
                    "quick_sync_records": quick_sync.write.written,
                    "quick_sync_stopped": quick_sync.stop_label(),
                }),
            )
            .await;
        if let Err(e) = advanced {
            let err = SyncError::Storage(e);
            tracing::error!(%connection_id, error = %err, "could not enter bulk import");
            self.mark_failed(connection_id, &err).await;
            return Err(err);
        }
        tracing::info!(
            %connection_id,
            records = quick_sync.write.written,
            stopped = quick_sync.stop_label(),
            "quick sync finished, starting historical import"
        );

        let import = tokio::spawn(async move { self.run_historical_import(connection).await });

        Ok(SyncHandle {
            connection_id,
            quick_sync,
            import,
        })
    }

    pub async fn get_sync_status(&self, connection_id: Uuid) -> Result<SyncStatusView, SyncError> {
        self.ports
            .connections
            .get(connection_id)
            .await?
            .map(|c| SyncStatusView::from(&c))
            .ok_or(SyncError::NotFound(connection_id))
    }

    /// Fetch the recent window page by page, writing each page as it lands.
    ///
    /// The time budget bounds fetching only. A page that arrived before the
    /// deadline is always written in full, so the granular upsert and the
    /// aggregate cleanup for a date are never split. Only a permanent fetch
    /// failure is an error.
    pub async fn run_quick_sync(&self, connection: &Connection) -> Result<QuickSyncReport, SyncError> {
        let mut report = QuickSyncReport::default();
        let deadline = Instant::now() + self.settings.quick_timeout;
        self.walk_recent_pages(connection, deadline, &mut report).await?;
        if report.timed_out {
            tracing::warn!(
                connection_id = %connection.id,
                timeout_ms = self.settings.quick_timeout.as_millis() as u64,
                "quick sync hit its time budget, keeping partial results"
            );
        }
        Ok(report)
    }

    async fn walk_recent_pages(
        &self,
        connection: &Connection,
        deadline: Instant,
        report: &mut QuickSyncReport,
    ) -> Result<(), SyncError> {
        let window = self
            .settings
            .quick_window_days
            .clamp(*QUICK_WINDOW_DAYS.start(), *QUICK_WINDOW_DAYS.end());
        let since = Utc::now().date_naive() - chrono::Duration::days(window);
        let writer = IdempotentWriter::new(self.ports.records.clone(), self.settings.write_batch_size);
        let collector = PaginatedCollector::new(
            self.ports.api.as_ref(),
            &connection.credential,
            self.settings.max_pages,
        );

        for entity_type in self.enabled(quick_sync_entity_types(connection.platform)) {
            let idx = report.entities.len();
            report.entities.push(EntityQuickSync {
                entity_type,
                pages: 0,
                records: 0,
                decode_errors: 0,
                stopped: None,
            });

            let first = PageRequest::first(entity_type, self.settings.page_size).since(since);
            let mut pages = collector.pages(first);
            loop {
                let event = match tokio::time::timeout_at(deadline, pages.next()).await {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(_) => {
                        report.timed_out = true;
                        return Ok(());
                    }
                };
                match event {
                    PageEvent::Page(page) => {
                        let entry = &mut report.entities[idx];
                        entry.pages = page.number;
                        entry.records += page.records.len();
                        entry.decode_errors += page.decode_errors.len();
                        let outcome = writer.upsert_batch(connection.id, page.records).await?;
                        report.write.merge(outcome);
                    }
                    PageEvent::Stopped(StopReason::FetchFailed(e)) if e.is_permanent() => {
                        return Err(SyncError::QuickSyncFailed(e));
                    }
                    PageEvent::Stopped(reason) => {
                        if let StopReason::FetchFailed(e) = &reason {
                            tracing::warn!(
                                connection_id = %connection.id,
                                %entity_type,
                                error = %e,
                                "quick sync fetch gave up, continuing with partial data"
                            );
                        }
                        report.entities[idx].stopped = Some(reason.as_str());
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one export per entity type concurrently and settle the connection.
    ///
    /// The claim is refreshed on a fixed beat while exports run so that a
    /// live import is never mistaken for an abandoned one.
    pub async fn run_historical_import(&self, connection: Connection) -> ImportReport {
        let entity_types = self.enabled(import_entity_types(connection.platform));
        let mut tasks = JoinSet::new();
        for &entity_type in &entity_types {
            let orchestrator = BulkJobOrchestrator::new(
                self.ports.clone(),
                &connection,
                self.settings.poll,
                self.settings.write_batch_size,
            )
            .with_download_attempts(self.settings.download_attempts);
            tasks.spawn(async move { orchestrator.run(entity_type).await });
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_period());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut jobs = Vec::with_capacity(entity_types.len());
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(outcome)) => jobs.push(outcome),
                    Some(Err(e)) => tracing::error!(connection_id = %connection.id, error = %e, "bulk import task aborted"),
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.ports.connections.touch(connection.id).await {
                        tracing::warn!(connection_id = %connection.id, error = %e, "could not refresh sync claim");
                    }
                }
            }
        }
        let reported: BTreeSet<EntityType> = jobs.iter().map(|j| j.entity_type).collect();
        for &entity_type in &entity_types {
            if !reported.contains(&entity_type) {
                jobs.push(JobOutcome::lost(entity_type, "bulk import task panicked"));
            }
        }
        jobs.sort_by_key(|j| j.entity_type);

        let final_status = if jobs.iter().all(JobOutcome::succeeded) {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        };

        let bulk_jobs: serde_json::Map<String, serde_json::Value> = jobs
            .iter()
            .map(|j| (j.entity_type.to_string(), json!(j.status.as_str())))
            .collect();
        let mut metadata = json!({ "bulk_jobs": bulk_jobs });
        if let Some(error) = jobs.iter().find_map(|j| j.error.as_ref()) {
            metadata["last_error"] = json!(error);
        }

        match self
            .ports
            .connections
            .update_status(connection.id, final_status, metadata)
            .await
        {
            Ok(_) => tracing::info!(
                connection_id = %connection.id,
                status = %final_status,
                jobs = jobs.len(),
                "historical import finished"
            ),
            Err(LumenError::NotFound(_)) => tracing::info!(
                connection_id = %connection.id,
                "connection deleted during historical import"
            ),
            Err(LumenError::Conflict(reason)) => tracing::warn!(
                connection_id = %connection.id,
                %reason,
                "sync claim was taken over, outcome not recorded"
            ),
            Err(e) => tracing::error!(
                connection_id = %connection.id,
                error = %e,
                "could not record historical import outcome"
            ),
        }

        ImportReport {
            connection_id: connection.id,
            final_status,
            jobs,
        }
    }

    /// Claims not refreshed since this instant are considered abandoned.
    pub fn stale_before(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.settings.claim_lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn heartbeat_period(&self) -> Duration {
        (self.settings.claim_lease / 3).max(Duration::from_millis(1))
    }

    fn enabled(&self, platform_types: &[EntityType]) -> Vec<EntityType> {
        platform_types
            .iter()
            .copied()
            .filter(|e| self.settings.entity_types.contains(e))
            .collect()
    }

    async fn rejection(&self, connection_id: Uuid) -> Result<SyncError, SyncError> {
        Ok(match self.ports.connections.get(connection_id).await? {
            Some(c) if !c.is_revoked() => SyncError::AlreadyRunning {
                connection_id,
                status: c.sync_status,
            },
            _ => SyncError::NotFound(connection_id),
        })
    }

    async fn mark_failed(&self, connection_id: Uuid, error: &SyncError) {
        let metadata = json!({
            "quick_sync_stopped": error.stop_label(),
            "last_error": error.to_string(),
        });
        if let Err(e) = self
            .ports
            .connections
            .update_status(connection_id, SyncStatus::Failed, metadata)
            .await
        {
            tracing::warn!(%connection_id, error = %e, "could not mark connection failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use lumen_db::bulk_jobs::repositories::BulkJobRepository;
    use lumen_db::connections::repositories::ConnectionRepository;
    use lumen_db::memory::MemoryStore;
    use lumen_db::records::repositories::RecordStore;
    use reqwest::StatusCode;

    use super::*;
    use crate::config::PollSettings;
    use crate::platform::{ByteStream, ExportStatus, Page, PlatformApi, SubmittedExport};

    /// In-process platform: one page of recent records per entity and one
    /// export body per entity. Job ids are the entity type name.
    #[derive(Default)]
    struct FakePlatform {
        recent: HashMap<EntityType, Vec<serde_json::Value>>,
        exports: HashMap<EntityType, String>,
        failing_exports: Vec<EntityType>,
        panicking_exports: Vec<EntityType>,
        list_error: Option<StatusCode>,
        list_delay: Option<Duration>,
        export_delay: Option<Duration>,
    }

    #[async_trait]
    impl PlatformApi for FakePlatform {
        async fn list_page(&self, _: &str, request: &PageRequest) -> Result<Page, FetchError> {
            if let Some(delay) = self.list_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(status) = self.list_error {
                return Err(FetchError::Permanent {
                    status: Some(status),
                    body: "rejected".into(),
                });
            }
            Ok(Page {
                records: self.recent.get(&request.entity_type).cloned().unwrap_or_default(),
                next_cursor: None,
            })
        }

        async fn submit_export(&self, _: &str, entity_type: EntityType) -> Result<SubmittedExport, FetchError> {
            if self.panicking_exports.contains(&entity_type) {
                panic!("vendor client bug");
            }
            Ok(SubmittedExport {
                job_id: entity_type.to_string(),
                status: Some("running".into()),
            })
        }

        async fn export_status(&self, _: &str, job_id: &str) -> Result<ExportStatus, FetchError> {
            if let Some(delay) = self.export_delay {
                tokio::time::sleep(delay).await;
            }
            let entity_type: EntityType = job_id.parse().map_err(FetchError::Decode)?;
            Ok(if self.failing_exports.contains(&entity_type) {
                ExportStatus {
                    status: "failed".into(),
                    result_url: None,
                    error_code: Some("INTERNAL".into()),
                }
            } else {
                ExportStatus {
                    status: "completed".into(),
                    result_url: Some(job_id.to_string()),
                    error_code: None,
                }
            })
        }

        async fn download_export(&self, _: &str, result_url: &str) -> Result<ByteStream, FetchError> {
            let entity_type: EntityType = result_url.parse().map_err(FetchError::Decode)?;
            let body = self.exports.get(&entity_type).cloned().unwrap_or_default();
            Ok(futures::stream::iter(vec![Ok(body.into_bytes())]).boxed())
        }
    }

    fn ids(prefix: &str, n: usize) -> Vec<serde_json::Value> {
        (1..=n).map(|i| json!({ "id": format!("{prefix}{i}") })).collect()
    }

    fn ndjson(values: &[serde_json::Value]) -> String {
        values.iter().map(|v| format!("{v}\n")).collect()
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            poll: PollSettings {
                interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                timeout: Duration::from_secs(5),
            },
            quick_timeout: Duration::from_secs(5),
            ..SyncSettings::default()
        }
    }

    fn shopify() -> FakePlatform {
        let mut api = FakePlatform::default();
        api.recent.insert(EntityType::Orders, ids("O", 3));
        api.exports.insert(EntityType::Orders, ndjson(&ids("O", 4)));
        api.exports.insert(EntityType::Customers, ndjson(&ids("C", 2)));
        api.exports.insert(EntityType::Products, ndjson(&ids("P", 5)));
        api
    }

    async fn controller(api: FakePlatform, settings: SyncSettings) -> (MemoryStore, ConnectionSyncController, Uuid) {
        let store = MemoryStore::new();
        let conn = Connection::new(Uuid::new_v4(), Platform::Shopify, "shop-token");
        let conn = ConnectionRepository::create(&store, conn).await.unwrap();
        let ports = SyncPorts::in_memory(Arc::new(api), store.clone());
        (store, ConnectionSyncController::new(ports, settings), conn.id)
    }

    #[tokio::test]
    async fn two_phase_sync_completes() {
        let (store, controller, id) = controller(shopify(), settings()).await;

        let handle = controller.start_sync(id).await.unwrap();
        assert_eq!(handle.quick_sync.records_fetched(), 3);
        assert_eq!(handle.quick_sync.stop_label(), "exhausted");

        let status = controller.get_sync_status(id).await.unwrap();
        assert_eq!(status.status, SyncStatus::BulkImporting);
        assert_eq!(status.stage_metadata["mini_sync_completed"], true);
        assert_eq!(status.stage_metadata["quick_sync_records"], 3);

        let report = handle.import.await.unwrap();
        assert_eq!(report.final_status, SyncStatus::Completed);
        assert_eq!(report.jobs.len(), 3);

        assert_eq!(store.count(id, EntityType::Orders).await.unwrap(), 4);
        assert_eq!(store.count(id, EntityType::Products).await.unwrap(), 5);
        let status = controller.get_sync_status(id).await.unwrap();
        assert_eq!(status.status, SyncStatus::Completed);
        assert!(status.last_synced_at.is_some());
        assert_eq!(status.stage_metadata["bulk_jobs"]["customers"], "completed");
        assert_eq!(store.list_for_connection(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn second_start_while_importing_is_rejected() {
        let (_, controller, id) = controller(shopify(), settings()).await;

        let handle = controller.start_sync(id).await.unwrap();
        let err = controller.start_sync(id).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::AlreadyRunning { status: SyncStatus::BulkImporting, .. }
        ));

        handle.import.await.unwrap();
        // Settled connections can be synced again.
        let again = controller.start_sync(id).await.unwrap();
        again.import.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_claim_once() {
        let (_, controller, id) = controller(shopify(), settings()).await;

        let (a, b) = tokio::join!(controller.start_sync(id), controller.start_sync(id));
        let started = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(started, 1);
        for handle in [a, b].into_iter().flatten() {
            handle.import.await.unwrap();
        }
    }

    #[tokio::test]
    async fn revoked_or_missing_connection_is_not_found() {
        let (store, controller, id) = controller(shopify(), settings()).await;
        store.revoke(id).unwrap();

        assert!(matches!(controller.start_sync(id).await, Err(SyncError::NotFound(_))));
        assert!(matches!(
            controller.start_sync(Uuid::new_v4()).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn permanent_quick_sync_failure_fails_the_connection() {
        let mut api = shopify();
        api.list_error = Some(StatusCode::UNAUTHORIZED);
        let (store, controller, id) = controller(api, settings()).await;

        let err = controller.start_sync(id).await.err().unwrap();
        assert!(matches!(err, SyncError::QuickSyncFailed(_)));

        let status = controller.get_sync_status(id).await.unwrap();
        assert_eq!(status.status, SyncStatus::Failed);
        assert_eq!(status.stage_metadata["quick_sync_stopped"], "fetch_failed");
        assert!(store.list_for_connection(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_quick_sync_times_out_and_import_still_runs() {
        let mut api = shopify();
        api.list_delay = Some(Duration::from_millis(200));
        let settings = SyncSettings {
            quick_timeout: Duration::from_millis(20),
            ..settings()
        };
        let (store, controller, id) = controller(api, settings).await;

        let handle = controller.start_sync(id).await.unwrap();
        assert!(handle.quick_sync.timed_out);
        let status = controller.get_sync_status(id).await.unwrap();
        assert_eq!(status.stage_metadata["quick_sync_stopped"], "timed_out");

        let report = handle.import.await.unwrap();
        assert_eq!(report.final_status, SyncStatus::Completed);
        assert_eq!(store.count(id, EntityType::Orders).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn one_failed_export_does_not_stop_siblings() {
        let mut api = shopify();
        api.failing_exports.push(EntityType::Customers);
        let (store, controller, id) = controller(api, settings()).await;

        let report = controller.start_sync(id).await.unwrap().import.await.unwrap();

        assert_eq!(report.final_status, SyncStatus::Failed);
        assert_eq!(report.failed_jobs(), 1);
        assert_eq!(store.count(id, EntityType::Orders).await.unwrap(), 4);
        assert_eq!(store.count(id, EntityType::Products).await.unwrap(), 5);

        let status = controller.get_sync_status(id).await.unwrap();
        assert_eq!(status.status, SyncStatus::Failed);
        assert_eq!(status.stage_metadata["bulk_jobs"]["customers"], "failed");
        assert_eq!(status.stage_metadata["mini_sync_completed"], true);
        assert!(status.stage_metadata["last_error"]
            .as_str()
            .unwrap()
            .contains("INTERNAL"));
    }

    #[tokio::test]
    async fn panicked_export_task_counts_as_failure() {
        let mut api = shopify();
        api.panicking_exports.push(EntityType::Products);
        let (store, controller, id) = controller(api, settings()).await;

        let report = controller.start_sync(id).await.unwrap().import.await.unwrap();

        assert_eq!(report.final_status, SyncStatus::Failed);
        let products = report
            .jobs
            .iter()
            .find(|j| j.entity_type == EntityType::Products)
            .unwrap();
        assert!(!products.succeeded());
        assert_eq!(store.count(id, EntityType::Customers).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn entity_types_are_limited_by_settings() {
        let settings = SyncSettings {
            entity_types: vec![EntityType::Orders],
            ..settings()
        };
        let (store, controller, id) = controller(shopify(), settings).await;

        let report = controller.start_sync(id).await.unwrap().import.await.unwrap();

        assert_eq!(report.jobs.len(), 1);
        assert_eq!(store.count(id, EntityType::Customers).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_of_unknown_connection_is_not_found() {
        let (_, controller, _) = controller(shopify(), settings()).await;
        assert!(matches!(
            controller.get_sync_status(Uuid::new_v4()).await,
            Err(SyncError::NotFound(_))
        ));
    }

    /// Memory-backed records whose aggregate cleanup is slow, or whose writes
    /// all fail.
    struct UnevenRecords {
        inner: MemoryStore,
        delete_delay: Option<Duration>,
        refuse_writes: bool,
    }

    #[async_trait]
    impl RecordStore for UnevenRecords {
        async fn upsert_records(
            &self,
            records: &[lumen_db::records::models::StoredRecord],
        ) -> lumen_common::error::LumenResult<u64> {
            if self.refuse_writes {
                return Err(LumenError::Database("disk full".into()));
            }
            self.inner.upsert_records(records).await
        }

        async fn granular_dates(
            &self,
            connection_id: Uuid,
            entity_type: EntityType,
            dates: &[chrono::NaiveDate],
        ) -> lumen_common::error::LumenResult<std::collections::HashSet<chrono::NaiveDate>> {
            self.inner.granular_dates(connection_id, entity_type, dates).await
        }

        async fn delete_aggregates(
            &self,
            connection_id: Uuid,
            entity_type: EntityType,
            dates: &[chrono::NaiveDate],
        ) -> lumen_common::error::LumenResult<u64> {
            if let Some(delay) = self.delete_delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.delete_aggregates(connection_id, entity_type, dates).await
        }

        async fn count(&self, connection_id: Uuid, entity_type: EntityType) -> lumen_common::error::LumenResult<i64> {
            self.inner.count(connection_id, entity_type).await
        }

        async fn list(
            &self,
            connection_id: Uuid,
            entity_type: EntityType,
        ) -> lumen_common::error::LumenResult<Vec<lumen_db::records::models::StoredRecord>> {
            self.inner.list(connection_id, entity_type).await
        }
    }

    /// Memory-backed connections that refuse to enter bulk import.
    struct StuckConnections {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ConnectionRepository for StuckConnections {
        async fn create(&self, c: Connection) -> lumen_common::error::LumenResult<Connection> {
            ConnectionRepository::create(&self.inner, c).await
        }

        async fn get(&self, id: Uuid) -> lumen_common::error::LumenResult<Option<Connection>> {
            ConnectionRepository::get(&self.inner, id).await
        }

        async fn list_by_status(
            &self,
            status: SyncStatus,
            limit: i64,
        ) -> lumen_common::error::LumenResult<Vec<Connection>> {
            self.inner.list_by_status(status, limit).await
        }

        async fn list_stale_claims(
            &self,
            stale_before: DateTime<Utc>,
            limit: i64,
        ) -> lumen_common::error::LumenResult<Vec<Connection>> {
            self.inner.list_stale_claims(stale_before, limit).await
        }

        async fn try_begin_sync(
            &self,
            id: Uuid,
            stale_before: DateTime<Utc>,
        ) -> lumen_common::error::LumenResult<Option<Connection>> {
            self.inner.try_begin_sync(id, stale_before).await
        }

        async fn touch(&self, id: Uuid) -> lumen_common::error::LumenResult<bool> {
            self.inner.touch(id).await
        }

        async fn update_status(
            &self,
            id: Uuid,
            status: SyncStatus,
            metadata: serde_json::Value,
        ) -> lumen_common::error::LumenResult<Connection> {
            if status == SyncStatus::BulkImporting {
                return Err(LumenError::Database("connection reset by peer".into()));
            }
            self.inner.update_status(id, status, metadata).await
        }
    }

    async fn wait_for_status(controller: &ConnectionSyncController, id: Uuid, want: SyncStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if controller.get_sync_status(id).await.unwrap().status == want {
                return;
            }
            assert!(Instant::now() < deadline, "connection never reached {want}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn dropped_caller_does_not_strand_the_claim() {
        let mut api = shopify();
        api.list_delay = Some(Duration::from_millis(100));
        let (store, controller, id) = controller(api, settings()).await;

        let cut_short = tokio::time::timeout(Duration::from_millis(10), controller.start_sync(id)).await;
        assert!(cut_short.is_err());

        wait_for_status(&controller, id, SyncStatus::Completed).await;
        assert_eq!(store.count(id, EntityType::Orders).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn failed_move_to_bulk_import_fails_the_connection() {
        let store = MemoryStore::new();
        let conn = Connection::new(Uuid::new_v4(), Platform::Shopify, "shop-token");
        let id = ConnectionRepository::create(&store, conn).await.unwrap().id;
        let ports = SyncPorts {
            connections: Arc::new(StuckConnections { inner: store.clone() }),
            ..SyncPorts::in_memory(Arc::new(shopify()), store.clone())
        };
        let controller = ConnectionSyncController::new(ports, settings());

        let err = controller.start_sync(id).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));

        let status = controller.get_sync_status(id).await.unwrap();
        assert_eq!(status.status, SyncStatus::Failed);
        assert_eq!(status.stage_metadata["quick_sync_stopped"], "storage_error");
        assert!(store.list_for_connection(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_during_quick_sync_is_labelled() {
        let store = MemoryStore::new();
        let conn = Connection::new(Uuid::new_v4(), Platform::Shopify, "shop-token");
        let id = ConnectionRepository::create(&store, conn).await.unwrap().id;
        let ports = SyncPorts {
            records: Arc::new(UnevenRecords {
                inner: store.clone(),
                delete_delay: None,
                refuse_writes: true,
            }),
            ..SyncPorts::in_memory(Arc::new(shopify()), store.clone())
        };
        let controller = ConnectionSyncController::new(ports, settings());

        let err = controller.start_sync(id).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));

        let status = controller.get_sync_status(id).await.unwrap();
        assert_eq!(status.status, SyncStatus::Failed);
        assert_eq!(status.stage_metadata["quick_sync_stopped"], "storage_error");
        assert!(status.stage_metadata["last_error"]
            .as_str()
            .unwrap()
            .contains("disk full"));
    }

    #[tokio::test]
    async fn abandoned_claim_is_taken_over_after_the_lease() {
        let settings = SyncSettings {
            claim_lease: Duration::from_millis(50),
            ..settings()
        };
        let (store, controller, id) = controller(shopify(), settings).await;

        // A process that claimed the connection and then died mid-import.
        store.try_begin_sync(id, Utc::now()).await.unwrap().unwrap();
        store
            .update_status(id, SyncStatus::BulkImporting, json!({ "mini_sync_completed": true }))
            .await
            .unwrap();

        assert!(matches!(
            controller.start_sync(id).await,
            Err(SyncError::AlreadyRunning { .. })
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let report = controller.start_sync(id).await.unwrap().import.await.unwrap();
        assert_eq!(report.final_status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn live_import_keeps_its_claim() {
        let mut api = shopify();
        api.export_delay = Some(Duration::from_millis(200));
        let settings = SyncSettings {
            claim_lease: Duration::from_millis(60),
            ..settings()
        };
        let (_, controller, id) = controller(api, settings).await;

        let handle = controller.start_sync(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            controller.start_sync(id).await,
            Err(SyncError::AlreadyRunning { status: SyncStatus::BulkImporting, .. })
        ));

        let report = handle.import.await.unwrap();
        assert_eq!(report.final_status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn quick_sync_deadline_never_splits_a_write() {
        let store = MemoryStore::new();
        let conn = Connection::new(Uuid::new_v4(), Platform::MetaAds, "ads-token");
        let id = ConnectionRepository::create(&store, conn).await.unwrap().id;

        let day = Utc::now().date_naive() - chrono::Duration::days(1);
        store
            .upsert_records(&[lumen_db::records::models::StoredRecord {
                connection_id: id,
                entity_type: EntityType::AdInsights,
                natural_key: format!("{day}:act_1"),
                record_date: Some(day),
                granularity: Some(lumen_db::records::models::Granularity::Aggregate),
                payload: json!({ "level": "account", "spend": "90.00" }),
                synced_at: Utc::now(),
            }])
            .await
            .unwrap();

        let mut api = FakePlatform::default();
        api.recent.insert(
            EntityType::AdInsights,
            vec![json!({ "date_start": day.to_string(), "level": "ad", "account_id": "act_1", "ad_id": "ad_1" })],
        );
        let ports = SyncPorts {
            records: Arc::new(UnevenRecords {
                inner: store.clone(),
                delete_delay: Some(Duration::from_millis(300)),
                refuse_writes: false,
            }),
            ..SyncPorts::in_memory(Arc::new(api), store.clone())
        };
        let settings = SyncSettings {
            quick_timeout: Duration::from_millis(100),
            ..settings()
        };
        let controller = ConnectionSyncController::new(ports, settings);

        let handle = controller.start_sync(id).await.unwrap();
        assert_eq!(handle.quick_sync.write.aggregates_superseded, 1);

        let rows = store.list(id, EntityType::AdInsights).await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec![format!("{day}:ad_1")]);
        handle.import.await.unwrap();
    }

    #[test]
    fn failure_labels_follow_the_error() {
        let fetch = SyncError::QuickSyncFailed(FetchError::Decode("x".into()));
        assert_eq!(fetch.stop_label(), "fetch_failed");
        assert_eq!(SyncError::Storage(LumenError::Database("x".into())).stop_label(), "storage_error");
        assert_eq!(SyncError::Interrupted("panic".into()).stop_label(), "interrupted");
    }

    #[test]
    fn stop_label_prefers_first_abnormal_stop() {
        let entry = |stopped| EntityQuickSync {
            entity_type: EntityType::Orders,
            pages: 1,
            records: 1,
            decode_errors: 0,
            stopped,
        };
        let report = QuickSyncReport {
            entities: vec![entry(Some("exhausted")), entry(Some("page_limit"))],
            ..Default::default()
        };
        assert_eq!(report.stop_label(), "page_limit");
        assert_eq!(report.records_fetched(), 2);
    }
}
