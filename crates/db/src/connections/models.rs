use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Shopify,
    MetaAds,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shopify => "shopify",
            Self::MetaAds => "meta_ads",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "shopify" => Ok(Self::Shopify),
            "meta_ads" => Ok(Self::MetaAds),
            _ => Err(format!("unknown platform: {value}")),
        }
    }
}

/// Sync lifecycle of one connection.
///
/// ```text
/// NotStarted --start--> QuickSyncRunning --ok--> BulkImporting --all ok--> Completed
///                       QuickSyncRunning --fail--> Failed
///                                         BulkImporting --any failure--> Failed
/// ```
///
/// `Completed` and `Failed` may be restarted by a new sync request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NotStarted,
    QuickSyncRunning,
    BulkImporting,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::QuickSyncRunning => "quick_sync_running",
            Self::BulkImporting => "bulk_importing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// A sync is in flight; a new one must be rejected.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::QuickSyncRunning | Self::BulkImporting)
    }

    pub fn can_start(&self) -> bool {
        !self.is_active()
    }

    /// States a connection may be in immediately before entering `self`.
    pub fn predecessors(&self) -> &'static [SyncStatus] {
        use SyncStatus::*;
        match self {
            NotStarted => &[],
            QuickSyncRunning => &[NotStarted, Completed, Failed],
            BulkImporting => &[QuickSyncRunning],
            Completed => &[BulkImporting],
            Failed => &[QuickSyncRunning, BulkImporting],
        }
    }

    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_started" => Ok(Self::NotStarted),
            "quick_sync_running" => Ok(Self::QuickSyncRunning),
            "bulk_importing" => Ok(Self::BulkImporting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown sync status: {value}")),
        }
    }
}

/// One authorized integration (brand x platform).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub brand_id: Uuid,
    pub platform: Platform,
    /// Opaque handle presented to the vendor as the bearer credential.
    #[serde(skip_serializing, default)]
    pub credential: String,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub stage_metadata: serde_json::Value,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(brand_id: Uuid, platform: Platform, credential: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            brand_id,
            platform,
            credential: credential.into(),
            sync_status: SyncStatus::NotStarted,
            last_synced_at: None,
            stage_metadata: serde_json::json!({}),
            revoked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Read-only projection served to UI progress polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusView {
    pub connection_id: Uuid,
    pub status: SyncStatus,
    pub stage_metadata: serde_json::Value,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl From<&Connection> for SyncStatusView {
    fn from(c: &Connection) -> Self {
        Self {
            connection_id: c.id,
            status: c.sync_status,
            stage_metadata: c.stage_metadata.clone(),
            last_synced_at: c.last_synced_at,
        }
    }
}

/// Shallow-merge `patch` into `target`; both are expected to be JSON objects.
pub fn merge_metadata(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p {
                t.insert(k.clone(), v.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}
