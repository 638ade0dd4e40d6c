use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use lumen_common::error::{LumenError, LumenResult};
use lumen_config::{get_parsed_or, get_var};
use lumen_db::records::models::EntityType;

use crate::fetcher::{CredentialLimiter, FetchError, FetchRequest, RateLimitedFetcher, RetryPolicy};
use crate::records::opt_string_or_number;

/// One page request against the paginated list endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub entity_type: EntityType,
    pub cursor: Option<String>,
    pub since: Option<NaiveDate>,
    pub fields: Vec<String>,
    pub limit: u32,
}

impl PageRequest {
    pub fn first(entity_type: EntityType, limit: u32) -> Self {
        Self {
            entity_type,
            cursor: None,
            since: None,
            fields: Vec::new(),
            limit,
        }
    }

    pub fn since(mut self, since: NaiveDate) -> Self {
        self.since = Some(since);
        self
    }

    /// Same query, next cursor.
    pub fn next(&self, cursor: String) -> Self {
        Self {
            cursor: Some(cursor),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedExport {
    #[serde(deserialize_with = "required_id")]
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportStatus {
    pub status: String,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub error_code: Option<String>,
}

/// Raw export body, chunked as it arrives.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, FetchError>>;

/// Read-only view of a commerce or ad platform.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn list_page(&self, credential: &str, request: &PageRequest) -> Result<Page, FetchError>;

    async fn submit_export(
        &self,
        credential: &str,
        entity_type: EntityType,
    ) -> Result<SubmittedExport, FetchError>;

    async fn export_status(
        &self,
        credential: &str,
        remote_job_id: &str,
    ) -> Result<ExportStatus, FetchError>;

    async fn download_export(&self, credential: &str, result_url: &str)
        -> Result<ByteStream, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpPlatformConfig {
    pub base_url: String,
    /// Connect and per-read idle limit for every call, and the whole-exchange
    /// limit for JSON calls. Export downloads have no total limit.
    pub timeout_secs: u64,
}

impl HttpPlatformConfig {
    pub fn from_env() -> LumenResult<Self> {
        let base_url = get_var("PLATFORM_BASE_URL")?;
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(LumenError::Config("PLATFORM_BASE_URL is empty".to_string()));
        }
        Ok(Self {
            base_url,
            timeout_secs: get_parsed_or("SYNC_HTTP_TIMEOUT_SECS", 30)?,
        })
    }
}

#[derive(Clone)]
pub struct HttpPlatformApi {
    fetcher: RateLimitedFetcher,
    config: HttpPlatformConfig,
}

impl HttpPlatformApi {
    pub fn new(
        config: HttpPlatformConfig,
        retry: RetryPolicy,
        limiter: CredentialLimiter,
    ) -> Result<Self, reqwest::Error> {
        let limit = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .connect_timeout(limit)
            .read_timeout(limit)
            .build()?;
        Ok(Self {
            fetcher: RateLimitedFetcher::new(client, retry, limiter),
            config,
        })
    }

    pub fn fetcher(&self) -> &RateLimitedFetcher {
        &self.fetcher
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        request: FetchRequest,
    ) -> Result<T, FetchError> {
        let request = request.timeout(Duration::from_secs(self.config.timeout_secs));
        let response = self.fetcher.fetch(&request).await?;
        let body = response.text().await.map_err(|e| FetchError::TransientNetwork {
            attempts: 1,
            last_error: e.to_string(),
        })?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PlatformApi for HttpPlatformApi {
    async fn list_page(&self, credential: &str, request: &PageRequest) -> Result<Page, FetchError> {
        let url = format!("{}/v1/{}", self.config.base_url, request.entity_type);
        let mut req = FetchRequest::get(url, credential).query("limit", request.limit.to_string());
        if let Some(cursor) = &request.cursor {
            req = req.query("cursor", cursor.as_str());
        }
        if let Some(since) = request.since {
            req = req.query("since", since.to_string());
        }
        if !request.fields.is_empty() {
            req = req.query("fields", request.fields.join(","));
        }
        self.fetch_json(req).await
    }

    async fn submit_export(
        &self,
        credential: &str,
        entity_type: EntityType,
    ) -> Result<SubmittedExport, FetchError> {
        let url = format!("{}/v1/bulk/{}", self.config.base_url, entity_type);
        let req = FetchRequest::post(
            url,
            credential,
            serde_json::json!({ "entity_type": entity_type }),
        );
        self.fetch_json(req).await
    }

    async fn export_status(
        &self,
        credential: &str,
        remote_job_id: &str,
    ) -> Result<ExportStatus, FetchError> {
        let url = format!("{}/v1/bulk/jobs/{}", self.config.base_url, remote_job_id);
        self.fetch_json(FetchRequest::get(url, credential)).await
    }

    /// Streams the export body. Only connect and idle-read limits apply, so a
    /// large file that keeps arriving is never cut off.
    async fn download_export(
        &self,
        credential: &str,
        result_url: &str,
    ) -> Result<ByteStream, FetchError> {
        let response = self
            .fetcher
            .fetch(&FetchRequest::get(result_url, credential))
            .await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk.map(|b| b.to_vec()).map_err(|e| FetchError::TransientNetwork {
                    attempts: 1,
                    last_error: e.to_string(),
                })
            })
            .boxed())
    }
}

fn required_id<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    use serde::de::Error as _;
    opt_string_or_number(deserializer)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| D::Error::custom("missing job id"))
}
