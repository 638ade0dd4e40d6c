use std::time::Duration;

use lumen_common::error::{LumenError, LumenResult};
use lumen_config::get_parsed_or;
use lumen_db::records::models::EntityType;

use crate::fetcher::RetryPolicy;

/// Bulk export polling cadence. Deliberately slower than fetch retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    /// Wait before poll number `poll` (1-based): grows linearly, capped.
    pub fn delay_for(&self, poll: u32) -> Duration {
        self.interval.saturating_mul(poll.max(1)).min(self.max_interval)
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(4 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub retry: RetryPolicy,
    pub max_in_flight_per_credential: usize,
    pub max_pages: usize,
    pub page_size: u32,
    pub quick_window_days: i64,
    pub quick_timeout: Duration,
    pub poll: PollSettings,
    pub write_batch_size: usize,
    /// Times an export body is re-requested after the stream breaks.
    pub download_attempts: u32,
    /// A claim whose heartbeat is older than this may be taken over.
    pub claim_lease: Duration,
    pub entity_types: Vec<EntityType>,
}

/// Quick-sync windows outside this range are rejected at load time.
pub const QUICK_WINDOW_DAYS: std::ops::RangeInclusive<i64> = 1..=365;

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_in_flight_per_credential: 4,
            max_pages: 10,
            page_size: 250,
            quick_window_days: 7,
            quick_timeout: Duration::from_secs(25),
            poll: PollSettings::default(),
            write_batch_size: 500,
            download_attempts: 3,
            claim_lease: Duration::from_secs(15 * 60),
            entity_types: EntityType::ALL.to_vec(),
        }
    }
}

impl SyncSettings {
    /// Load sync tuning from `SYNC_*` environment variables.
    /// Unset variables take defaults; malformed ones are rejected.
    pub fn from_env() -> LumenResult<Self> {
        let d = Self::default();

        let retry = RetryPolicy {
            max_attempts: get_parsed_or("SYNC_FETCH_MAX_ATTEMPTS", d.retry.max_attempts)?,
            base_delay: Duration::from_millis(get_parsed_or("SYNC_BACKOFF_BASE_MS", 1000u64)?),
            max_delay: Duration::from_millis(get_parsed_or("SYNC_BACKOFF_CAP_MS", 5000u64)?),
        };
        if retry.max_attempts == 0 {
            return Err(LumenError::Config(
                "SYNC_FETCH_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let poll = PollSettings {
            interval: Duration::from_secs(get_parsed_or("SYNC_POLL_INTERVAL_SECS", 10u64)?),
            max_interval: Duration::from_secs(get_parsed_or("SYNC_POLL_MAX_INTERVAL_SECS", 60u64)?),
            timeout: Duration::from_secs(get_parsed_or("SYNC_POLL_TIMEOUT_SECS", 14_400u64)?),
        };

        let write_batch_size = get_parsed_or("SYNC_WRITE_BATCH_SIZE", d.write_batch_size)?;
        if write_batch_size == 0 {
            return Err(LumenError::Config(
                "SYNC_WRITE_BATCH_SIZE must be at least 1".to_string(),
            ));
        }

        let quick_window_days = get_parsed_or("SYNC_QUICK_WINDOW_DAYS", d.quick_window_days)?;
        if !QUICK_WINDOW_DAYS.contains(&quick_window_days) {
            return Err(LumenError::Config(format!(
                "SYNC_QUICK_WINDOW_DAYS must be between {} and {}, got {quick_window_days}",
                QUICK_WINDOW_DAYS.start(),
                QUICK_WINDOW_DAYS.end()
            )));
        }

        let download_attempts = get_parsed_or("SYNC_DOWNLOAD_ATTEMPTS", d.download_attempts)?;
        if download_attempts == 0 {
            return Err(LumenError::Config(
                "SYNC_DOWNLOAD_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let claim_lease = Duration::from_secs(get_parsed_or("SYNC_CLAIM_LEASE_SECS", 900u64)?);
        if claim_lease.is_zero() {
            return Err(LumenError::Config(
                "SYNC_CLAIM_LEASE_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            retry,
            max_in_flight_per_credential: get_parsed_or(
                "SYNC_MAX_IN_FLIGHT_PER_CREDENTIAL",
                d.max_in_flight_per_credential,
            )?,
            max_pages: get_parsed_or("SYNC_MAX_PAGES", d.max_pages)?,
            page_size: get_parsed_or("SYNC_PAGE_SIZE", d.page_size)?,
            quick_window_days,
            quick_timeout: Duration::from_secs(get_parsed_or("SYNC_QUICK_TIMEOUT_SECS", 25u64)?),
            poll,
            write_batch_size,
            download_attempts,
            claim_lease,
            entity_types: parse_entity_types("SYNC_ENTITY_TYPES")?.unwrap_or(d.entity_types),
        })
    }
}

/// Parse a comma-separated entity type list. `Ok(None)` when unset.
pub fn parse_entity_types(env_key: &str) -> LumenResult<Option<Vec<EntityType>>> {
    let Ok(raw) = std::env::var(env_key) else {
        return Ok(None);
    };

    let mut types = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let entity: EntityType = part
            .to_lowercase()
            .parse()
            .map_err(|e| LumenError::Config(format!("invalid {env_key}: {e}")))?;
        if !types.contains(&entity) {
            types.push(entity);
        }
    }

    if types.is_empty() {
        return Err(LumenError::Config(format!(
            "{env_key} is set but lists no entity types"
        )));
    }
    Ok(Some(types))
}
