//! HTTP Remote Job Client
//!
//! reqwest implementation of [`RemoteJobClient`]:
//! - `POST {base}/task` multipart upload
//! - `GET {base}/task/{id}` status check
//! - streamed result download
//!
//! Submission and download retry transient errors with exponential backoff.
//! Status checks are single attempts; the poller owns their retry cadence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{RemoteJobClient, StatusResponse, SubmitOptions, SubmitResponse};
use crate::core::{CoreError, CoreResult, TransportFailure};

// =============================================================================
// Constants
// =============================================================================

/// Default base URL of the job processor
pub const DEFAULT_BASE_URL: &str = "https://aiaudioeditor.webberapp.shop/api";

/// Default per-request timeout (seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

/// Maximum retry attempts for transient errors
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Maximum allowed download size (500 MB)
const MAX_DOWNLOAD_BYTES: u64 = 500 * 1024 * 1024;

/// Extension used when the result URL does not carry a usable one
const FALLBACK_DOWNLOAD_EXTENSION: &str = "mp3";

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

// =============================================================================
// HttpJobClient
// =============================================================================

/// HTTP client for the remote job processor
pub struct HttpJobClient {
    client: reqwest::Client,
    base_url: String,
    retry_base_delay: Duration,
}

impl std::fmt::Debug for HttpJobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJobClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpJobClient {
    /// Create a client with the given per-request timeout
    pub fn new(request_timeout: Duration) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            retry_base_delay: Duration::from_millis(BASE_RETRY_DELAY_MS),
        })
    }

    /// Set custom base URL
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the first backoff delay; later attempts double it
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn submit_url(&self) -> String {
        format!("{}/task", self.base_url)
    }

    fn status_url(&self, job_id: &str) -> String {
        format!("{}/task/{}", self.base_url, job_id)
    }

    /// Validate that the download URL is a safe HTTP(S) URL.
    pub fn validate_download_url(url: &str) -> CoreResult<reqwest::Url> {
        let parsed = reqwest::Url::parse(url).map_err(|e| {
            CoreError::ValidationError(format!("Invalid download URL '{}': {}", url, e))
        })?;

        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            scheme => Err(CoreError::ValidationError(format!(
                "Unsupported download URL scheme '{}'. Only http/https are allowed.",
                scheme
            ))),
        }
    }

    /// Execute an HTTP request with retries and exponential backoff
    async fn execute_with_retry<F, Fut, T>(&self, operation: &str, f: F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= MAX_RETRIES {
                        return Err(e);
                    }

                    let delay = self.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "Remote {} attempt {} failed, retrying in {}ms: {}",
                        operation,
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Parse an error response body
    fn parse_api_error(status: StatusCode, body: &str) -> CoreError {
        if let Ok(err_resp) = serde_json::from_str::<ApiErrorResponse>(body) {
            let detail = err_resp
                .error
                .or(err_resp.message)
                .or_else(|| err_resp.detail.map(|d| match d {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                }));
            if let Some(detail) = detail {
                return CoreError::RemoteHttp {
                    status: status.as_u16(),
                    message: detail,
                };
            }
        }

        CoreError::RemoteHttp {
            status: status.as_u16(),
            message: body.chars().take(500).collect(),
        }
    }

    fn network_error(e: reqwest::Error) -> CoreError {
        CoreError::Transport {
            kind: transport_failure(&e),
            message: e.to_string(),
        }
    }

    async fn read_status_body(resp: reqwest::Response) -> CoreResult<StatusResponse> {
        let status = resp.status();
        let body = resp.text().await.map_err(Self::network_error)?;

        if !status.is_success() {
            return Err(Self::parse_api_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            CoreError::InvalidRemoteResponse(format!("Failed to parse response: {}", e))
        })
    }

    async fn download_once(&self, url: &reqwest::Url, output_path: &Path) -> CoreResult<u64> {
        let mut resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(Self::network_error)?;

        if !resp.status().is_success() {
            return Err(CoreError::RemoteHttp {
                status: resp.status().as_u16(),
                message: format!("Download of {} failed", url),
            });
        }

        if let Some(content_len) = resp.content_length() {
            if content_len > MAX_DOWNLOAD_BYTES {
                return Err(CoreError::ValidationError(format!(
                    "Result is too large ({} bytes > {} bytes limit)",
                    content_len, MAX_DOWNLOAD_BYTES
                )));
            }
        }

        let mut file = tokio::fs::File::create(output_path).await?;

        let mut total_bytes: u64 = 0;
        while let Some(chunk) = resp.chunk().await.map_err(Self::network_error)? {
            total_bytes = total_bytes.saturating_add(chunk.len() as u64);
            if total_bytes > MAX_DOWNLOAD_BYTES {
                return Err(CoreError::ValidationError(format!(
                    "Result exceeded max size limit ({} bytes)",
                    MAX_DOWNLOAD_BYTES
                )));
            }

            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        Ok(total_bytes)
    }
}

fn transport_failure(e: &reqwest::Error) -> TransportFailure {
    if e.is_timeout() {
        TransportFailure::Timeout
    } else if e.is_connect() {
        TransportFailure::Connect
    } else {
        TransportFailure::Other
    }
}

/// Picks a file extension for a downloaded result from its URL path
fn download_extension(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| FALLBACK_DOWNLOAD_EXTENSION.to_string())
}

/// Content type sent with the uploaded file
fn upload_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("m4a") => "audio/m4a",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("aac") => "audio/aac",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl RemoteJobClient for HttpJobClient {
    async fn submit(&self, file: &Path, options: &SubmitOptions) -> CoreResult<SubmitResponse> {
        let bytes = tokio::fs::read(file).await?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let mime = upload_mime(file);
        let url = self.submit_url();

        let response = self
            .execute_with_retry("submit", || {
                let client = self.client.clone();
                let url = url.clone();
                let fields = options.form_fields();
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime)
                    .map_err(|e| CoreError::Internal(format!("Invalid upload mime: {}", e)));

                async move {
                    let mut form = reqwest::multipart::Form::new();
                    for (name, value) in fields {
                        form = form.text(name, value);
                    }
                    let form = form.part("file", part?);

                    let resp = client
                        .post(&url)
                        .multipart(form)
                        .send()
                        .await
                        .map_err(Self::network_error)?;

                    Self::read_status_body(resp).await
                }
            })
            .await?;

        info!(
            "Submitted {} to remote processor: job_id={}, status={}",
            file.display(),
            response.id,
            response.status
        );

        Ok(response.into())
    }

    async fn fetch_status(&self, id: &str) -> CoreResult<StatusResponse> {
        let resp = self
            .client
            .get(self.status_url(id))
            .send()
            .await
            .map_err(Self::network_error)?;

        let response = Self::read_status_body(resp).await?;
        debug!("Status for job {}: {}", id, response.status);
        Ok(response)
    }

    async fn download(&self, url: &str, dest_dir: &Path) -> CoreResult<PathBuf> {
        let validated_url = Self::validate_download_url(url)?;
        tokio::fs::create_dir_all(dest_dir).await?;

        let output_path = dest_dir.join(format!(
            "{}.{}",
            uuid::Uuid::new_v4(),
            download_extension(&validated_url)
        ));

        let result = self
            .execute_with_retry("download", || self.download_once(&validated_url, &output_path))
            .await;

        match result {
            Ok(total_bytes) => {
                info!(
                    "Downloaded result to {} ({} bytes)",
                    output_path.display(),
                    total_bytes
                );
                Ok(output_path)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&output_path).await;
                Err(e)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
