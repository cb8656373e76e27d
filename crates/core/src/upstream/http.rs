//! HTTP implementation of the upstream API.

use super::{parse_descriptor, DealpathApi, FileDescriptor, FileDownload, RetryPolicy, DEALPATH_ACCEPT};
use crate::config::UpstreamSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::session::Credential;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Longest slice of an upstream error body echoed back in messages.
const ERROR_BODY_LIMIT: usize = 200;

/// reqwest-backed client for the Dealpath API.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: Url,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpUpstream {
    pub fn new(settings: &UpstreamSettings) -> GatewayResult<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(DEALPATH_ACCEPT));

        // No client-wide timeout: streamed downloads may legitimately run long.
        // API calls set a per-request timeout instead.
        let client = Client::builder()
            .connect_timeout(settings.timeout())
            .default_headers(headers)
            .user_agent(concat!("dealgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url()?,
            timeout: settings.timeout(),
            retry: RetryPolicy::with_max_retries(settings.max_retries),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build an API URL from individually encoded path segments.
    fn api_url(&self, segments: &[&str]) -> GatewayResult<Url> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(GatewayError::InvalidArguments(format!(
                "invalid path segment '{}'",
                bad
            )));
        }

        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| GatewayError::Config("DEALPATH_BASE_URL cannot be a base".into()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    /// Send a request, retrying timeouts, 429 and 5xx with backoff.
    async fn send_with_retry(&self, request: RequestBuilder) -> GatewayResult<Response> {
        let mut attempts = 0;

        loop {
            let attempt = request
                .try_clone()
                .ok_or_else(|| GatewayError::Internal("request cannot be cloned".to_string()))?;

            let err = match attempt.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => error_from_response(response).await,
                Err(e) => GatewayError::from(e),
            };

            if attempts < self.retry.max_retries && err.is_retryable() {
                let backoff = self.retry.backoff_for_attempt(attempts);
                warn!(
                    attempt = attempts + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Upstream request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempts += 1;
                continue;
            }
            return Err(err);
        }
    }
}

async fn error_from_response(response: Response) -> GatewayError {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return GatewayError::NotFound("upstream record".to_string());
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("error").to_string()
    } else {
        body.chars().take(ERROR_BODY_LIMIT).collect()
    };
    GatewayError::UpstreamStatus {
        status: status.as_u16(),
        message,
    }
}

#[async_trait::async_trait]
impl DealpathApi for HttpUpstream {
    async fn get_json(
        &self,
        credential: &Credential,
        segments: &[&str],
        query: &[(String, String)],
    ) -> GatewayResult<Value> {
        let url = self.api_url(segments)?;
        debug!(path = %url.path(), params = query.len(), "GET upstream");

        let request = self
            .client
            .get(url)
            .bearer_auth(credential.expose())
            .query(query)
            .timeout(self.timeout);

        let response = self.send_with_retry(request).await?;
        response.json::<Value>().await.map_err(GatewayError::from)
    }

    async fn file_descriptor(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> GatewayResult<FileDescriptor> {
        let payload = self
            .get_json(credential, &["file", file_id, "download_url"], &[])
            .await
            .map_err(|e| match e {
                GatewayError::NotFound(_) => GatewayError::NotFound(format!("file {}", file_id)),
                other => other,
            })?;
        parse_descriptor(file_id, &payload)
    }

    async fn open_download(&self, descriptor: &FileDescriptor) -> GatewayResult<FileDownload> {
        let url = Url::parse(&descriptor.remote_signed_url)
            .map_err(|_| GatewayError::Upstream("invalid signed download URL".to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::Upstream(format!(
                "unsupported download URL scheme '{}'",
                url.scheme()
            )));
        }
        debug!(file_id = %descriptor.file_id, host = url.host_str().unwrap_or(""), "Opening signed download");

        // Signed URLs are pre-authorized: no bearer credential, generic Accept.
        let request = self.client.get(url).header(header::ACCEPT, "*/*");
        let response = tokio::time::timeout(self.timeout, self.send_with_retry(request))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout)??;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| descriptor.content_type.clone());
        let content_length = response.content_length().or(descriptor.size);

        Ok(FileDownload {
            content_type,
            content_length,
            body: response.bytes_stream().map_err(GatewayError::from).boxed(),
        })
    }
}
