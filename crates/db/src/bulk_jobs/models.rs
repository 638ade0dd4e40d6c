use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::records::models::EntityType;

/// Remote export job lifecycle: `Created -> Running -> {Completed | Failed | Canceled}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BulkJobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bulk job transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: BulkJobStatus,
    pub to: BulkJobStatus,
}

impl BulkJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn can_transition_to(&self, next: BulkJobStatus) -> bool {
        use BulkJobStatus::*;
        match (self, next) {
            (Created, Running) => true,
            (Created | Running, Failed | Canceled) => true,
            (Running, Completed) => true,
            _ => false,
        }
    }

    /// Validated transition. Staying in the same non-terminal state is a no-op.
    pub fn transition(self, next: BulkJobStatus) -> Result<BulkJobStatus, InvalidTransition> {
        if self == next && !self.is_terminal() {
            return Ok(self);
        }
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Map a vendor status string onto the job state machine.
    /// Vendors spell these differently (`CANCELLED`, `in_progress`, `done`, ...).
    pub fn from_remote(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" | "queued" | "pending" => Some(Self::Created),
            "running" | "in_progress" | "processing" => Some(Self::Running),
            "completed" | "complete" | "done" | "succeeded" => Some(Self::Completed),
            "failed" | "error" | "expired" => Some(Self::Failed),
            "canceled" | "cancelled" | "canceling" | "cancelling" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for BulkJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkJobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("unknown bulk job status: {value}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub remote_job_id: String,
    pub entity_type: EntityType,
    pub status: BulkJobStatus,
    pub records_processed: i64,
    pub records_skipped: i64,
    pub decode_errors: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkJob {
    /// A freshly submitted job. Stored as `Running` whatever the vendor calls
    /// its initial state; `Created` is never persisted.
    pub fn submitted(connection_id: Uuid, entity_type: EntityType, remote_job_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            remote_job_id,
            entity_type,
            status: BulkJobStatus::Running,
            records_processed: 0,
            records_skipped: 0,
            decode_errors: 0,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Final counters written when a job reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCompletion {
    pub records_processed: i64,
    pub records_skipped: i64,
    pub decode_errors: i64,
    pub error_message: Option<String>,
}
