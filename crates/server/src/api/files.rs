use super::handlers::credential;
use super::ApiResult;
use crate::config::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Redirect, Response},
};
use dealgate_core::files::{sanitize_filename, CacheEntry, Delivery};
use dealgate_core::upstream::FileDownload;
use dealgate_core::{FileDescriptor, FileDownloadStrategy, GatewayError};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

const OCTET_STREAM: &str = "application/octet-stream";

fn content_disposition(kind: &str, filename: &str) -> String {
    format!("{}; filename=\"{}\"", kind, sanitize_filename(filename))
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| GatewayError::Internal(format!("invalid header value: {}", e)).into())
}

/// `GET /mcp/getFileById/{file_id}`: redirect, stream through, or serve the
/// cached copy, per the configured strategy.
pub async fn get_file_by_id(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
) -> ApiResult<Response> {
    let credential = credential(&state, &headers)?;

    if state.delivery.strategy() == FileDownloadStrategy::ProxyStream {
        let (descriptor, download) = state.delivery.open_stream(&credential, &file_id).await?;
        tracing::info!(file_id = %file_id, "Streaming file from upstream");
        return stream_response(&descriptor, download);
    }

    match state.delivery.deliver(&credential, &file_id).await? {
        Delivery::Remote { descriptor } | Delivery::Proxied { descriptor } => {
            Ok(Redirect::temporary(&descriptor.remote_signed_url).into_response())
        }
        Delivery::Cached { entry, .. } => {
            let (path, entry) = state
                .delivery
                .local_file(&entry.key.day, &entry.key.file_id, &entry.filename)
                .await?;
            file_response(&path, &entry).await
        }
    }
}

/// Pipe upstream bytes to the client. Dropping the response body drops the
/// upstream stream.
fn stream_response(descriptor: &FileDescriptor, download: FileDownload) -> ApiResult<Response> {
    let content_type = download
        .content_type
        .as_deref()
        .or(descriptor.content_type.as_deref())
        .unwrap_or(OCTET_STREAM);

    let mut response = Response::new(Body::from_stream(download.body));
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, header_value(content_type)?);
    h.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition("attachment", &descriptor.filename))?,
    );
    if let Some(len) = download.content_length {
        h.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    Ok(response)
}

/// `GET /local-files/{date}/{file_id}/{filename}`
pub async fn serve_local_file(
    State(state): State<Arc<AppState>>,
    Path((date, file_id, filename)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let (path, entry) = state.delivery.local_file(&date, &file_id, &filename).await?;
    file_response(&path, &entry).await
}

async fn file_response(path: &std::path::Path, entry: &CacheEntry) -> ApiResult<Response> {
    // The sweeper may have removed the file since the lookup.
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| GatewayError::NotFound("file".to_string()))?;
    let len = file
        .metadata()
        .await
        .map_err(|_| GatewayError::NotFound("file".to_string()))?
        .len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let h = response.headers_mut();
    h.insert(
        header::CONTENT_TYPE,
        header_value(entry.content_type.as_deref().unwrap_or(OCTET_STREAM))?,
    );
    h.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    h.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    h.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition("inline", &entry.filename))?,
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use wiremock::matchers::{header as has_header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn upstream_with_file(id: &str, bytes: &'static [u8]) -> MockServer {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/file/{}/download_url", id)))
            .and(has_header("authorization", "Bearer server-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/signed/{}?sig=abc", upstream.uri(), id),
                "name": "Q3 report.pdf"
            })))
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/signed/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_raw(bytes, "application/pdf"))
            .mount(&upstream)
            .await;
        upstream
    }

    fn local_path_of(link: &str) -> String {
        let start = link.find("/local-files/").unwrap();
        link[start..].to_string()
    }

    #[tokio::test]
    async fn test_remote_only_redirects_to_signed_url() {
        let upstream = upstream_with_file("42", b"%PDF-1.7").await;
        let t = app(&upstream.uri(), FileDownloadStrategy::RemoteOnly, None).await;

        let res = send(&t.router, get("/mcp/getFileById/42")).await;
        assert_eq!(res.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = res.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert!(location.ends_with("/signed/42?sig=abc"));
        assert!(t.state.delivery.cache().is_none());
    }

    #[tokio::test]
    async fn test_proxy_stream_passes_bytes_and_names_file() {
        let upstream = upstream_with_file("42", b"%PDF-1.7").await;
        let t = app(&upstream.uri(), FileDownloadStrategy::ProxyStream, None).await;

        let res = send(&t.router, get("/mcp/getFileById/42")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get(header::CONTENT_TYPE).unwrap(), "application/pdf");
        assert_eq!(
            res.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"Q3_report.pdf\""
        );
        assert_eq!(body_bytes(res).await, b"%PDF-1.7");
        // Nothing was written locally
        assert!(!t._dir.path().join("files").exists());
    }

    /// Signed-URL host that sends headers and one chunk of a much larger body,
    /// then reports when the client hangs up.
    async fn stalled_file_host() -> (String, tokio::sync::oneshot::Receiver<()>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/pdf\r\ncontent-length: 1048576\r\n\r\n%PDF-1.7")
                .await
                .unwrap();
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            let _ = closed_tx.send(());
        });
        (format!("http://{}", addr), closed_rx)
    }

    #[tokio::test]
    async fn test_proxy_stream_disconnect_aborts_upstream_and_stores_nothing() {
        use http_body_util::BodyExt;

        let (file_host, closed) = stalled_file_host().await;
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file/42/download_url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/signed/42?sig=abc", file_host),
                "name": "big.pdf"
            })))
            .mount(&upstream)
            .await;
        let t = app(&upstream.uri(), FileDownloadStrategy::ProxyStream, None).await;

        let res = send(&t.router, get("/mcp/getFileById/42")).await;
        assert_eq!(res.status(), StatusCode::OK);
        let mut body = res.into_body();
        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(first.starts_with(b"%PDF"));

        // Client goes away mid-transfer
        drop(body);
        tokio::time::timeout(std::time::Duration::from_secs(5), closed)
            .await
            .expect("upstream transfer was not aborted")
            .unwrap();
        assert!(!t._dir.path().join("files").exists());
    }

    #[tokio::test]
    async fn test_local_cache_tool_link_serves_bytes_once_downloaded() {
        let upstream = upstream_with_file("42", b"%PDF-1.7").await;
        let t = app(&upstream.uri(), FileDownloadStrategy::LocalCache, None).await;

        let call = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                          "params": {"name": "get_file_by_id", "arguments": {"file_id": "42"}}});
        let first = body_json(send(&t.router, rpc(&call, &[])).await).await;
        let second = body_json(send(&t.router, rpc(&call, &[])).await).await;

        let first_local = first["result"]["content"][1]["uri"].as_str().unwrap().to_string();
        let second_local = second["result"]["content"][1]["uri"].as_str().unwrap().to_string();
        assert_eq!(first_local, second_local);
        assert!(first_local.ends_with("/42/Q3_report.pdf"));

        let downloads = upstream
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/signed/42")
            .count();
        assert_eq!(downloads, 1);

        let res = send(&t.router, get(&local_path_of(&first_local))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");
        assert_eq!(res.headers().get(header::CONTENT_TYPE).unwrap(), "application/pdf");
        assert_eq!(body_bytes(res).await, b"%PDF-1.7");

        // The REST helper serves the same cached copy
        let res = send(&t.router, get("/mcp/getFileById/42")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_bytes(res).await, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn test_local_files_traversal_and_auth() {
        let upstream = upstream_with_file("42", b"%PDF-1.7").await;
        let t = app(&upstream.uri(), FileDownloadStrategy::LocalCache, Some("tok")).await;
        let auth = [("authorization", "Bearer tok")];

        for uri in [
            "/local-files/20240101/..%2F..%2Fetc/passwd",
            "/local-files/20240101/42/..%2F..%2Fsecret",
            "/local-files/..%2F/42/a.pdf",
            "/local-files/20240101/42/missing.pdf",
        ] {
            let res = send(&t.router, get_with(uri, &auth)).await;
            assert_eq!(res.status(), StatusCode::NOT_FOUND, "{}", uri);
        }

        let res = send(&t.router, get("/local-files/20240101/42/a.pdf")).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file/nope/download_url"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&upstream)
            .await;
        let t = app(&upstream.uri(), FileDownloadStrategy::RemoteOnly, None).await;
        let res = send(&t.router, get("/mcp/getFileById/nope")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
