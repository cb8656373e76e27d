use super::{DEALPATH_KEY_HEADER, MCP_SESSION_ID};
use crate::config::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use dealgate_core::{Credential, SessionId};
use dealgate_mcp::protocol::PROTOCOL_VERSION;
use dealgate_mcp::RequestContext;
use std::sync::Arc;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Session and credential headers shared by `/mcp` and the REST helpers.
pub(super) fn request_context(state: &AppState, headers: &HeaderMap) -> RequestContext {
    RequestContext {
        session_id: header_str(headers, MCP_SESSION_ID).map(SessionId::new),
        credential_header: Credential::from_optional(header_str(headers, DEALPATH_KEY_HEADER)),
        base_url: state.base_url(headers),
    }
}

/// `POST /mcp`: one JSON-RPC request or a batch. Always HTTP 200; failures
/// travel in the JSON-RPC error object.
pub async fn handle(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let ctx = request_context(&state, &headers);
    let dispatched = state.mcp.handle_body(&body, &ctx).await;

    let mut response = Json(dispatched.body).into_response();
    if let Some(session_id) = dispatched.session_id {
        match HeaderValue::from_str(session_id.as_str()) {
            Ok(value) => {
                response.headers_mut().insert(MCP_SESSION_ID, value);
            }
            Err(e) => tracing::error!(error = %e, "Session id is not a valid header value"),
        }
    }
    response
}

/// `GET /mcp`: connectivity probe, open even when a token is configured.
pub async fn probe() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "message": "Dealgate MCP HTTP endpoint",
        "protocolVersion": PROTOCOL_VERSION,
    }))
}
