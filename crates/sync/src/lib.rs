//! Platform data synchronization engine.
//!
//! Onboards a newly authorized storefront or ad-account connection in two
//! phases: a bounded quick sync of recent records through the paginated list
//! endpoint, then a detached historical import that drives one vendor bulk
//! export job per entity type to completion.
//!
//! Building blocks, leaf first:
//!
//! - [`fetcher::RateLimitedFetcher`]: one outbound call with classified,
//!   bounded retries and a per-credential in-flight cap.
//! - [`pagination::PaginatedCollector`]: cursor walking with a page ceiling.
//! - [`writer::IdempotentWriter`]: natural-key upserts plus granularity dominance.
//! - [`bulk::BulkJobOrchestrator`]: submit, poll, download and write one export.
//! - [`controller::ConnectionSyncController`]: the two-phase sequence and the
//!   connection's sync-status state machine.

pub mod bulk;
pub mod config;
pub mod controller;
pub mod fetcher;
pub mod ndjson;
pub mod pagination;
pub mod platform;
pub mod ports;
pub mod records;
pub mod writer;

pub use bulk::{BulkJobError, BulkJobOrchestrator, JobOutcome};
pub use config::{PollSettings, SyncSettings};
pub use controller::{ConnectionSyncController, SyncError, SyncHandle};
pub use fetcher::{CredentialLimiter, FetchError, RateLimitedFetcher, RetryPolicy};
pub use pagination::PaginatedCollector;
pub use platform::{HttpPlatformApi, HttpPlatformConfig, PlatformApi};
pub use ports::SyncPorts;
pub use writer::{IdempotentWriter, WriteOutcome};
