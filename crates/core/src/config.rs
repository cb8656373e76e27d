//! Typed configuration for the upstream client, sessions and file delivery.
//!
//! Values come from an optional TOML file and are overridden by environment
//! variables or CLI flags in the server binary; everything here only knows
//! about the merged result.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// How file bytes reach the caller. Fixed for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDownloadStrategy {
    /// Hand out the signed upstream URL, never touch local storage.
    #[default]
    RemoteOnly,
    /// Pipe upstream bytes straight to the client.
    ProxyStream,
    /// Download into the bounded local cache and serve from there.
    LocalCache,
}

impl FileDownloadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteOnly => "remote_only",
            Self::ProxyStream => "proxy_stream",
            Self::LocalCache => "local_cache",
        }
    }
}

impl fmt::Display for FileDownloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileDownloadStrategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote_only" => Ok(Self::RemoteOnly),
            "proxy_stream" => Ok(Self::ProxyStream),
            "local_cache" => Ok(Self::LocalCache),
            other => Err(GatewayError::Config(format!(
                "invalid FILE_DOWNLOAD_STRATEGY '{}' (expected remote_only, proxy_stream or local_cache)",
                other
            ))),
        }
    }
}

/// Ten years.
pub const MAX_CACHE_TTL_HOURS: u64 = 10 * 365 * 24;
/// One year.
pub const MAX_SESSION_IDLE_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub files: FileDeliveryConfig,

    #[serde(default)]
    pub sessions: SessionConfig,
}

impl GatewayConfig {
    /// Reject values that can never work. Called once at startup.
    pub fn validate(&self) -> GatewayResult<()> {
        self.upstream.base_url()?;
        if self.upstream.timeout_secs == 0 {
            return Err(GatewayError::Config("DEALPATH_TIMEOUT_SECS must be > 0".into()));
        }
        if self.files.cache_ttl_hours == 0 || self.files.cache_ttl_hours > MAX_CACHE_TTL_HOURS {
            return Err(GatewayError::Config(format!(
                "FILE_CACHE_TTL_HOURS must be between 1 and {}",
                MAX_CACHE_TTL_HOURS
            )));
        }
        if self.files.cache_max_files == 0 || self.files.cache_max_bytes == 0 {
            return Err(GatewayError::Config(
                "FILE_CACHE_MAX_FILES and FILE_CACHE_MAX_BYTES must be > 0".into(),
            ));
        }
        if self.sessions.idle_timeout_secs == 0 || self.sessions.idle_timeout_secs > MAX_SESSION_IDLE_SECS {
            return Err(GatewayError::Config(format!(
                "SESSION_IDLE_TIMEOUT_SECS must be between 1 and {}",
                MAX_SESSION_IDLE_SECS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://api.dealpath.com".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_max_retries() -> u32 {
    3
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl UpstreamSettings {
    pub fn base_url(&self) -> GatewayResult<Url> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            GatewayError::Config(format!("invalid DEALPATH_BASE_URL '{}': {}", self.base_url, e))
        })?;
        if url.cannot_be_a_base() {
            return Err(GatewayError::Config(format!(
                "DEALPATH_BASE_URL '{}' cannot be used as a base URL",
                self.base_url
            )));
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDeliveryConfig {
    #[serde(default)]
    pub strategy: FileDownloadStrategy,

    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,

    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,

    #[serde(default = "default_cache_max_files")]
    pub cache_max_files: usize,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./local_files")
}

fn default_cache_ttl_hours() -> u64 {
    24
}

fn default_cache_max_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_cache_max_files() -> usize {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for FileDeliveryConfig {
    fn default() -> Self {
        Self {
            strategy: FileDownloadStrategy::default(),
            storage_dir: default_storage_dir(),
            cache_ttl_hours: default_cache_ttl_hours(),
            cache_max_bytes: default_cache_max_bytes(),
            cache_max_files: default_cache_max_files(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl FileDeliveryConfig {
    /// Clamped to [`MAX_CACHE_TTL_HOURS`] for configs that skipped validation.
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours.min(MAX_CACHE_TTL_HOURS) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_timeout_secs.min(MAX_SESSION_IDLE_SECS) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "remote_only".parse::<FileDownloadStrategy>().unwrap(),
            FileDownloadStrategy::RemoteOnly
        );
        assert_eq!(
            " LOCAL_CACHE ".parse::<FileDownloadStrategy>().unwrap(),
            FileDownloadStrategy::LocalCache
        );
        assert!(matches!(
            "s3".parse::<FileDownloadStrategy>(),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.files.strategy, FileDownloadStrategy::RemoteOnly);
        assert_eq!(config.files.cache_ttl_hours, 24);
        assert_eq!(config.upstream.timeout(), Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "files": { "strategy": "proxy_stream", "cache_max_files": 5 }
        }))
        .unwrap();
        assert_eq!(config.files.strategy, FileDownloadStrategy::ProxyStream);
        assert_eq!(config.files.cache_max_files, 5);
        assert_eq!(config.files.cache_max_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.upstream.base_url, "https://api.dealpath.com");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.upstream.base_url = "not a url".into();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.files.cache_max_files = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_durations() {
        let mut config = GatewayConfig::default();
        config.files.cache_ttl_hours = 10_000_000_000;
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
        assert_eq!(config.files.ttl(), chrono::Duration::hours(MAX_CACHE_TTL_HOURS as i64));

        config.files.cache_ttl_hours = MAX_CACHE_TTL_HOURS;
        assert!(config.validate().is_ok());
        assert!(chrono::Utc::now().checked_add_signed(config.files.ttl()).is_some());

        config.sessions.idle_timeout_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
        assert_eq!(
            config.sessions.idle_timeout(),
            chrono::Duration::seconds(MAX_SESSION_IDLE_SECS as i64)
        );
    }
}
