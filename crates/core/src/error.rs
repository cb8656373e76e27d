//! Error types shared by every gateway crate.

use serde_json::{json, Value};

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types that can occur while brokering a request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The JSON-RPC envelope could not be interpreted.
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    /// No handler is registered for the method.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Tool arguments or method params failed validation.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Unknown tool, resource, file, or a rejected local path.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No upstream credential could be resolved for the request.
    #[error("Missing Dealpath credential: supply X-Dealpath-Key, initialize with dealpath_key, or configure DEALPATH_KEY")]
    CredentialMissing,

    /// The upstream did not answer within the configured timeout.
    #[error("Upstream request timed out")]
    UpstreamTimeout,

    /// The upstream answered with a non-success status.
    #[error("Upstream error (status {status}): {message}")]
    UpstreamStatus { status: u16, message: String },

    /// Transport failure or malformed upstream payload.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Invalid configuration, fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidArguments(_) => -32602,
            Self::CredentialMissing => -32001,
            Self::NotFound(_) => -32002,
            Self::UpstreamTimeout | Self::UpstreamStatus { .. } | Self::Upstream(_) => -32003,
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => -32603,
        }
    }

    /// Structured error data attached to JSON-RPC error objects.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::UpstreamStatus { status, .. } => Some(json!({ "status": status })),
            Self::UpstreamTimeout => Some(json!({ "timeout": true })),
            _ => None,
        }
    }

    /// Message safe to hand back to a client. Local I/O details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Io(_) | Self::Internal(_) | Self::Config(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout | Self::UpstreamStatus { .. } | Self::Upstream(_)
        )
    }

    /// Check if a failed upstream call is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamTimeout => true,
            Self::UpstreamStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout
        } else if let Some(status) = err.status() {
            Self::UpstreamStatus {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("error").to_string(),
            }
        } else if err.is_decode() {
            Self::Upstream("malformed upstream payload".to_string())
        } else {
            // without_url keeps signed query strings out of messages
            Self::Upstream(err.without_url().to_string())
        }
    }
}
