// Core types and functionality for the Dealgate gateway

pub mod config;
pub mod deals;
pub mod error;
pub mod files;
pub mod session;
pub mod upstream;

pub use config::{FileDeliveryConfig, FileDownloadStrategy, GatewayConfig, SessionConfig, UpstreamSettings};
pub use error::{GatewayError, GatewayResult};
pub use session::{Credential, CredentialSource, SessionId, SessionManager};
pub use upstream::{DealpathApi, FileDescriptor, HttpUpstream};
