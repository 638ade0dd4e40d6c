mod onboarding;

use std::sync::Arc;

use lumen_config::{get_parsed_or, init_tracing, AppConfig};
use lumen_sync::{
    ConnectionSyncController, CredentialLimiter, HttpPlatformApi, HttpPlatformConfig, SyncPorts,
    SyncSettings,
};

use crate::onboarding::{onboard_pending, ConnectionOutcome};

#[tokio::main]
async fn main() {
    init_tracing("info");

    let config = AppConfig::from_env().expect("failed to load config");
    let settings = SyncSettings::from_env().expect("failed to load sync settings");
    let platform = HttpPlatformConfig::from_env().expect("failed to load platform config");
    let limit: i64 = get_parsed_or("INGEST_BATCH_LIMIT", 50).expect("invalid INGEST_BATCH_LIMIT");
    tracing::info!(service = "lumen-ingest", limit, "starting");

    let pool = lumen_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");
    lumen_db::run_migrations(&pool)
        .await
        .expect("failed to run migrations");

    let api = HttpPlatformApi::new(
        platform,
        settings.retry,
        CredentialLimiter::new(settings.max_in_flight_per_credential),
    )
    .expect("failed to create platform client");
    let ports = SyncPorts::postgres(Arc::new(api), pool);
    let connections = ports.connections.clone();
    let controller = ConnectionSyncController::new(ports, settings);

    let summaries = match onboard_pending(&controller, connections, limit).await {
        Ok(summaries) => summaries,
        Err(e) => {
            tracing::error!(error = %e, "failed to list pending connections");
            return;
        }
    };

    for summary in &summaries {
        match &summary.outcome {
            ConnectionOutcome::Imported(report) => {
                tracing::info!(
                    connection_id = %summary.connection_id,
                    quick_sync_records = summary.quick_sync_records,
                    status = %report.final_status,
                    jobs = report.jobs.len(),
                    failed_jobs = report.failed_jobs(),
                    "connection onboarded"
                );
            }
            ConnectionOutcome::NotStarted(reason) => {
                tracing::warn!(connection_id = %summary.connection_id, reason = %reason, "connection skipped");
            }
            ConnectionOutcome::Aborted(reason) => {
                tracing::error!(connection_id = %summary.connection_id, reason = %reason, "import aborted");
            }
        }
    }

    let completed = summaries.iter().filter(|s| s.completed()).count();
    tracing::info!(
        total = summaries.len(),
        completed,
        failed = summaries.len() - completed,
        "ingest run finished"
    );
}
