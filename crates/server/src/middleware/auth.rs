use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// What a route requires before its handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Open,
    Bearer,
    /// Bearer plus the Origin allow-list (JSON-RPC entry point only).
    BearerAndOrigin,
}

/// Classify a request. `GET /mcp` and the health check stay open so clients
/// can probe connectivity.
pub fn protection_for(method: &Method, path: &str) -> Protection {
    match (method, path) {
        (&Method::OPTIONS, _) => Protection::Open,
        (_, "/api/health") => Protection::Open,
        (&Method::GET, "/mcp") => Protection::Open,
        (&Method::POST, "/mcp") => Protection::BearerAndOrigin,
        (_, p) if p.starts_with("/mcp/") || p.starts_with("/local-files/") => Protection::Bearer,
        _ => Protection::Open,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Rejection {
    Unauthorized,
    ForbiddenOrigin,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(serde_json::json!({
                    "error": {"code": "unauthorized", "message": "Missing or invalid bearer token."}
                })),
            )
                .into_response(),
            Rejection::ForbiddenOrigin => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": {"code": "forbidden_origin", "message": "Origin not allowed."}
                })),
            )
                .into_response(),
        }
    }
}

/// Bearer-token and Origin checks. Only a digest of the token is kept.
pub struct AuthGuard {
    token_digest: Option<[u8; 32]>,
    allowed_origins: Vec<String>,
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

impl AuthGuard {
    pub fn new(token: Option<&str>, allowed_origins: Vec<String>) -> Self {
        Self {
            token_digest: token.map(digest),
            allowed_origins: allowed_origins
                .into_iter()
                .map(|o| o.trim_end_matches('/').to_string())
                .collect(),
        }
    }

    pub fn token_required(&self) -> bool {
        self.token_digest.is_some()
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    /// With no token configured everything passes, origin included.
    pub fn check(&self, protection: Protection, headers: &HeaderMap) -> Result<(), Rejection> {
        let Some(expected) = &self.token_digest else {
            return Ok(());
        };
        if protection == Protection::Open {
            return Ok(());
        }

        if protection == Protection::BearerAndOrigin {
            if let Some(origin) = headers.get(header::ORIGIN) {
                let allowed = origin
                    .to_str()
                    .map(|o| self.allowed_origins.iter().any(|a| a == o.trim_end_matches('/')))
                    .unwrap_or(false);
                if !allowed {
                    return Err(Rejection::ForbiddenOrigin);
                }
            }
        }

        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                let (scheme, token) = v.split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            })
            .filter(|t| !t.is_empty());

        match presented {
            Some(token) if digest(token) == *expected => Ok(()),
            _ => Err(Rejection::Unauthorized),
        }
    }
}

/// Middleware applied to the whole router.
pub async fn require_auth(State(guard): State<Arc<AuthGuard>>, req: Request, next: Next) -> Response {
    let protection = protection_for(req.method(), req.uri().path());
    match guard.check(protection, req.headers()) {
        Ok(()) => next.run(req).await,
        Err(rejection) => {
            tracing::warn!(
                method = %req.method(),
                path = %req.uri().path(),
                reason = ?rejection,
                "Request rejected by auth guard"
            );
            rejection.into_response()
        }
    }
}
