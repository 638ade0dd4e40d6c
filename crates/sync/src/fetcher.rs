use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Vendor error codes that signal throttling even when the HTTP status is not 429.
const VENDOR_THROTTLE_CODES: [i64; 4] = [4, 17, 32, 613];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: `base * attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }

    /// A server-supplied wait still never exceeds the cap.
    pub fn server_delay(&self, retry_after: Duration) -> Duration {
        retry_after.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    RateLimited,
    TransientNetwork,
    Permanent,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::RateLimited => "rate_limited",
            Self::TransientNetwork => "transient_network",
            Self::Permanent => "permanent",
        })
    }
}

/// Classify a completed HTTP exchange.
pub fn classify_response(status: StatusCode, body: &str) -> Classification {
    if status == StatusCode::TOO_MANY_REQUESTS || has_throttle_code(body) {
        return Classification::RateLimited;
    }
    if status.is_success() {
        return Classification::Success;
    }
    if status.is_server_error() {
        return Classification::TransientNetwork;
    }
    Classification::Permanent
}

/// Classify a request that produced no usable response.
///
/// Only failures that would repeat identically on a second try are permanent:
/// a request that could not be built, a redirect policy violation, or a body
/// that does not decode. Everything else (refused, reset, closed mid-flight,
/// timed out) is treated as network trouble.
pub fn classify_transport(error: &reqwest::Error) -> Classification {
    if error.is_builder() || error.is_redirect() || error.is_decode() {
        Classification::Permanent
    } else {
        Classification::TransientNetwork
    }
}

fn has_throttle_code(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/code").and_then(|c| c.as_i64()))
        .is_some_and(|code| VENDOR_THROTTLE_CODES.contains(&code))
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("rate limited after {attempts} attempts: {last_error}")]
    RateLimited { attempts: u32, last_error: String },

    #[error("transient network failure after {attempts} attempts: {last_error}")]
    TransientNetwork { attempts: u32, last_error: String },

    /// `status` is `None` when the request never produced a response.
    #[error("permanent failure (HTTP {}): {body}", status.map(|s| s.as_u16().to_string()).unwrap_or_else(|| "-".into()))]
    Permanent {
        status: Option<StatusCode>,
        body: String,
    },

    #[error("response decode failed: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    /// The vendor rejected the credential itself.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Permanent {
                status: Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN),
                ..
            }
        )
    }

    pub fn classification(&self) -> Classification {
        match self {
            Self::RateLimited { .. } => Classification::RateLimited,
            Self::TransientNetwork { .. } => Classification::TransientNetwork,
            Self::Permanent { .. } | Self::Decode(_) => Classification::Permanent,
        }
    }
}

/// Caps concurrent in-flight calls per credential across every job sharing it.
#[derive(Debug, Clone)]
pub struct CredentialLimiter {
    permits: usize,
    semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl CredentialLimiter {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: permits.max(1),
            semaphores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn semaphores(&self) -> MutexGuard<'_, HashMap<String, Arc<Semaphore>>> {
        // A poisoned map still holds valid semaphores.
        self.semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn semaphore(&self, credential: &str) -> Arc<Semaphore> {
        let mut map = self.semaphores();
        // An entry only the map references has no holder and no waiter, so it
        // can be rebuilt on demand.
        map.retain(|_, sem| Arc::strong_count(sem) > 1);
        map.entry(credential.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits)))
            .clone()
    }

    pub async fn acquire(&self, credential: &str) -> Result<OwnedSemaphorePermit, FetchError> {
        self.semaphore(credential)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Permanent {
                status: None,
                body: "credential limiter closed".to_string(),
            })
    }

    /// Free slots for `credential` right now.
    pub fn available(&self, credential: &str) -> usize {
        self.semaphores()
            .get(credential)
            .map_or(self.permits, |sem| sem.available_permits())
    }

    /// Credentials currently holding an entry.
    pub fn tracked(&self) -> usize {
        self.semaphores().len()
    }
}

/// One outbound platform call, rebuilt for every attempt.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub credential: String,
    /// Whole-exchange deadline, including the body. `None` leaves only the
    /// client's connect and read timeouts in force.
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            body: None,
            credential: credential.into(),
            timeout: None,
        }
    }

    pub fn post(
        url: impl Into<String>,
        credential: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url, credential)
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Only reads may be replayed after an ambiguous network failure.
    /// A 429 means the vendor refused the call, so any method may retry it.
    fn replayable_after(&self, class: Classification) -> bool {
        match class {
            Classification::RateLimited => true,
            Classification::TransientNetwork => self.method == Method::GET,
            _ => false,
        }
    }
}

/// Executes platform calls with bounded, classified retries.
#[derive(Clone)]
pub struct RateLimitedFetcher {
    client: Client,
    policy: RetryPolicy,
    limiter: CredentialLimiter,
}

impl RateLimitedFetcher {
    pub fn new(client: Client, policy: RetryPolicy, limiter: CredentialLimiter) -> Self {
        Self {
            client,
            policy,
            limiter,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &CredentialLimiter {
        &self.limiter
    }

    /// Perform `request`, retrying rate-limit and transient failures.
    ///
    /// Makes at most `max_attempts` calls. On success the response is returned
    /// unread so callers can stream large bodies.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Response, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();
        let mut last_class = Classification::TransientNetwork;
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            attempts = attempt;
            let mut retry_after = None;

            // The permit covers the call itself, never the backoff sleep.
            let result = {
                let _permit = self.limiter.acquire(&request.credential).await?;
                self.send(request).await
            };

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    retry_after = parse_retry_after(&response);
                    let body = response.text().await.unwrap_or_default();
                    let class = classify_response(status, &body);
                    if class == Classification::Permanent {
                        return Err(FetchError::Permanent {
                            status: Some(status),
                            body,
                        });
                    }
                    last_class = class;
                    last_error = format!("HTTP {status}: {}", truncate(&body, 200));
                }
                Err(e) => {
                    let class = classify_transport(&e);
                    if class == Classification::Permanent {
                        return Err(FetchError::Permanent {
                            status: e.status(),
                            body: e.to_string(),
                        });
                    }
                    last_class = class;
                    last_error = e.to_string();
                }
            }

            if !request.replayable_after(last_class) {
                break;
            }
            if attempt == max_attempts {
                break;
            }

            let delay = match retry_after {
                Some(wait) => self.policy.server_delay(wait),
                None => self.policy.delay_for(attempt),
            };
            tracing::warn!(
                attempt,
                max_attempts,
                classification = %last_class,
                delay_ms = delay.as_millis() as u64,
                url = %request.url,
                "retrying platform call"
            );
            tokio::time::sleep(delay).await;
        }

        tracing::warn!(
            classification = %last_class,
            url = %request.url,
            error = %last_error,
            "platform call failed"
        );
        Err(match last_class {
            Classification::RateLimited => FetchError::RateLimited {
                attempts,
                last_error,
            },
            _ => FetchError::TransientNetwork {
                attempts,
                last_error,
            },
        })
    }

    async fn send(&self, request: &FetchRequest) -> Result<Response, reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .bearer_auth(&request.credential);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder.send().await
    }
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
