//! Client side of the upstream Dealpath API.
//!
//! Handlers only see the [`DealpathApi`] trait; the HTTP implementation lives
//! in [`http`]. Every call takes the resolved credential explicitly.

mod http;
mod retry;

pub use http::HttpUpstream;
pub use retry::RetryPolicy;

use crate::error::{GatewayError, GatewayResult};
use crate::session::Credential;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media type the upstream requires on every API call.
pub const DEALPATH_ACCEPT: &str = "application/vnd.dealpath.api.v1+json";

/// Query string pairs passed through to the upstream.
pub type QueryParams = Vec<(String, String)>;

/// Body of a file download, chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, GatewayError>>;

/// Metadata for one downloadable file. The signed URL carries its own expiry
/// and is only valid for the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub file_id: String,
    pub filename: String,
    pub remote_signed_url: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

/// An open download from a signed URL.
pub struct FileDownload {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FileDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDownload")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// The upstream record-and-file service.
#[async_trait::async_trait]
pub trait DealpathApi: Send + Sync {
    /// GET a JSON document. `segments` are path segments below the base URL and
    /// are percent-encoded individually.
    async fn get_json(
        &self,
        credential: &Credential,
        segments: &[&str],
        query: &[(String, String)],
    ) -> GatewayResult<Value>;

    /// Look up the signed download URL and filename for a file.
    async fn file_descriptor(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> GatewayResult<FileDescriptor>;

    /// Start fetching the bytes behind a descriptor's signed URL.
    async fn open_download(&self, descriptor: &FileDescriptor) -> GatewayResult<FileDownload>;

    async fn deals(&self, credential: &Credential, query: &[(String, String)]) -> GatewayResult<Value> {
        self.get_json(credential, &["deals"], query).await
    }

    async fn deal(&self, credential: &Credential, deal_id: &str) -> GatewayResult<Value> {
        self.get_json(credential, &["deal", deal_id], &[]).await
    }

    async fn search(&self, credential: &Credential, query: &str) -> GatewayResult<Value> {
        self.get_json(credential, &["search"], &[("query".to_string(), query.to_string())])
            .await
    }
}

/// Parse the `/file/{id}/download_url` payload.
pub(crate) fn parse_descriptor(file_id: &str, payload: &Value) -> GatewayResult<FileDescriptor> {
    let url = payload
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| GatewayError::Upstream("download URL missing from upstream response".into()))?;

    let filename = payload
        .get("name")
        .or_else(|| payload.get("filename"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| file_id.to_string());

    Ok(FileDescriptor {
        file_id: file_id.to_string(),
        filename,
        remote_signed_url: url.to_string(),
        content_type: payload
            .get("content_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        size: payload.get("size").and_then(Value::as_u64),
    })
}
