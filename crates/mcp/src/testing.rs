// In-memory upstream used by the unit tests

use bytes::Bytes;
use dealgate_core::upstream::{FileDownload, QueryParams};
use dealgate_core::{Credential, DealpathApi, FileDescriptor, GatewayError, GatewayResult};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Call {
    pub credential: String,
    pub segments: Vec<String>,
    pub query: QueryParams,
}

/// Answers `get_json` by first path segment; any id of `missing` is a 404.
#[derive(Default)]
pub struct FakeApi {
    responses: HashMap<String, Value>,
    fallback: Option<Value>,
    calls: Mutex<Vec<Call>>,
}

impl FakeApi {
    pub fn with_response(mut self, first_segment: &str, body: Value) -> Self {
        self.responses.insert(first_segment.to_string(), body);
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.fallback = Some(body);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DealpathApi for FakeApi {
    async fn get_json(
        &self,
        credential: &Credential,
        segments: &[&str],
        query: &[(String, String)],
    ) -> GatewayResult<Value> {
        self.calls.lock().unwrap().push(Call {
            credential: credential.expose().to_string(),
            segments: segments.iter().map(|s| s.to_string()).collect(),
            query: query.to_vec(),
        });
        if segments.contains(&"missing") {
            return Err(GatewayError::NotFound("upstream record".to_string()));
        }
        let first = segments.first().copied().unwrap_or_default();
        Ok(self
            .responses
            .get(first)
            .or(self.fallback.as_ref())
            .cloned()
            .unwrap_or_else(|| json!({"ok": true})))
    }

    async fn file_descriptor(&self, _credential: &Credential, file_id: &str) -> GatewayResult<FileDescriptor> {
        if file_id == "missing" {
            return Err(GatewayError::NotFound(format!("file {}", file_id)));
        }
        Ok(FileDescriptor {
            file_id: file_id.to_string(),
            filename: format!("doc {}.pdf", file_id),
            remote_signed_url: format!("https://files.example/{}?sig=abc", file_id),
            content_type: Some("application/pdf".to_string()),
            size: Some(4),
        })
    }

    async fn open_download(&self, _descriptor: &FileDescriptor) -> GatewayResult<FileDownload> {
        Ok(FileDownload {
            content_type: Some("application/pdf".to_string()),
            content_length: Some(4),
            body: futures::stream::iter(vec![Ok(Bytes::from_static(b"%PDF"))]).boxed(),
        })
    }
}
