use std::sync::Arc;

use lumen_common::error::LumenResult;
use lumen_db::connections::models::SyncStatus;
use lumen_db::connections::repositories::ConnectionRepository;
use lumen_sync::controller::ImportReport;
use lumen_sync::ConnectionSyncController;
use tokio::task::JoinSet;
use uuid::Uuid;

/// How one picked-up connection ended.
#[derive(Debug)]
pub enum ConnectionOutcome {
    Imported(ImportReport),
    /// Quick sync never got going: already claimed, revoked, or failed outright.
    NotStarted(String),
    /// The detached import task died before producing a report.
    Aborted(String),
}

#[derive(Debug)]
pub struct ConnectionSummary {
    pub connection_id: Uuid,
    pub quick_sync_records: usize,
    pub outcome: ConnectionOutcome,
}

impl ConnectionSummary {
    pub fn completed(&self) -> bool {
        matches!(
            &self.outcome,
            ConnectionOutcome::Imported(r) if r.final_status == SyncStatus::Completed
        )
    }
}

/// Start every connection still waiting for its first sync, plus any whose
/// sync was abandoned past its lease, and wait for all of their historical
/// imports. At most `limit` connections are picked up, new ones first.
pub async fn onboard_pending(
    controller: &ConnectionSyncController,
    connections: Arc<dyn ConnectionRepository>,
    limit: i64,
) -> LumenResult<Vec<ConnectionSummary>> {
    let mut pending = connections.list_by_status(SyncStatus::NotStarted, limit).await?;
    tracing::info!(count = pending.len(), "picked up connections awaiting first sync");

    let room = limit - pending.len() as i64;
    if room > 0 {
        let abandoned = connections
            .list_stale_claims(controller.stale_before(), room)
            .await?;
        if !abandoned.is_empty() {
            tracing::warn!(count = abandoned.len(), "resuming syncs abandoned past their lease");
        }
        pending.extend(abandoned);
    }

    let mut set = JoinSet::new();
    for connection in pending {
        let controller = controller.clone();
        set.spawn(async move { onboard_one(controller, connection.id).await });
    }

    let mut summaries = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(summary) => summaries.push(summary),
            Err(e) => tracing::error!(error = %e, "onboarding task panicked"),
        }
    }
    Ok(summaries)
}

async fn onboard_one(controller: ConnectionSyncController, connection_id: Uuid) -> ConnectionSummary {
    let handle = match controller.start_sync(connection_id).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(%connection_id, error = %e, "sync did not start");
            return ConnectionSummary {
                connection_id,
                quick_sync_records: 0,
                outcome: ConnectionOutcome::NotStarted(e.to_string()),
            };
        }
    };

    let quick_sync_records = handle.quick_sync.records_fetched();
    let outcome = match handle.import.await {
        Ok(report) => ConnectionOutcome::Imported(report),
        Err(e) => ConnectionOutcome::Aborted(e.to_string()),
    };

    ConnectionSummary {
        connection_id,
        quick_sync_records,
        outcome,
    }
}
