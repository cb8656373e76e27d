use crate::config::AppState;
use crate::middleware::auth::require_auth;
use anyhow::Result;
use axum::{
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dealgate_core::GatewayError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod files;
mod handlers;
mod mcp;

pub const MCP_SESSION_ID: &str = "mcp-session-id";
pub const DEALPATH_KEY_HEADER: &str = "x-dealpath-key";

/// Start the API server and run until Ctrl-C.
pub async fn serve(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(state.auth.allowed_origins());

    let mut router = Router::new()
        .route("/api/health", get(health_check))
        // JSON-RPC entry point and connectivity probe
        .route("/mcp", get(mcp::probe).post(mcp::handle));

    // REST helpers
    for (path, route) in handlers::record_routes() {
        router = router.route(&path, route);
    }

    router
        .route("/mcp/searchDeals", get(handlers::search_deals))
        .route("/mcp/getFileById/{file_id}", get(files::get_file_by_id))
        // Cached bytes
        .route("/local-files/{date}/{file_id}/{filename}", get(files::serve_local_file))
        // Middleware
        .layer(from_fn_with_state(state.auth.clone(), require_auth))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring unparseable allowed origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(MCP_SESSION_ID),
            HeaderName::from_static(DEALPATH_KEY_HEADER),
        ])
        .expose_headers([HeaderName::from_static(MCP_SESSION_ID)])
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "dealgate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

/// Error type for the REST helpers and file routes
#[derive(Debug)]
pub struct ApiError(GatewayError);

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            GatewayError::InvalidRequest(_) | GatewayError::MethodNotFound(_) | GatewayError::InvalidArguments(_) => {
                (StatusCode::BAD_REQUEST, "invalid_arguments")
            }
            GatewayError::CredentialMissing => (StatusCode::UNAUTHORIZED, "credential_missing"),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            GatewayError::UpstreamStatus { .. } | GatewayError::Upstream(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
            GatewayError::Config(_) | GatewayError::Io(_) | GatewayError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        // Not-found never says which check failed.
        let message = match &self.0 {
            GatewayError::NotFound(_) => "Not found".to_string(),
            other => other.public_message(),
        };
        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
