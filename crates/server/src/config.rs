use crate::middleware::auth::AuthGuard;
use anyhow::{Context, Result};
use axum::http::{header::HOST, HeaderMap};
use dealgate_core::files::FileDelivery;
use dealgate_core::{Credential, DealpathApi, FileDownloadStrategy, GatewayConfig, HttpUpstream, SessionManager};
use dealgate_mcp::McpServer;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything the binary needs, merged from the TOML file and the
/// environment / command line. Secrets are never read from the file.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(flatten)]
    pub gateway: GatewayConfig,

    /// Server-wide upstream credential (`DEALPATH_KEY`).
    #[serde(skip)]
    pub dealpath_key: Option<Credential>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base for links handed to clients; derived from `Host` when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: None,
        }
    }
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Bearer token for protected routes (`MCP_TOKEN`).
    #[serde(skip)]
    pub token: Option<SecretString>,

    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://127.0.0.1".to_string(), "http://localhost".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            allowed_origins: default_allowed_origins(),
        }
    }
}

/// Environment / CLI overrides. Each one wins over the file.
#[derive(clap::Args, Debug, Default)]
pub struct ConfigOverrides {
    /// Host to bind to
    #[arg(long, env = "DEALGATE_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "DEALGATE_PORT")]
    pub port: Option<u16>,

    /// Public base URL used in links returned to clients
    #[arg(long, env = "PUBLIC_BASE_URL")]
    pub public_base_url: Option<String>,

    /// Bearer token required on protected routes
    #[arg(long, env = "MCP_TOKEN", hide_env_values = true)]
    pub mcp_token: Option<String>,

    /// Comma-separated Origin allow-list for POST /mcp
    #[arg(long, env = "ALLOWED_ORIGINS")]
    pub allowed_origins: Option<String>,

    /// Server-wide Dealpath API key
    #[arg(long, env = "DEALPATH_KEY", hide_env_values = true)]
    pub dealpath_key: Option<String>,

    #[arg(long, env = "DEALPATH_BASE_URL")]
    pub dealpath_base_url: Option<String>,

    #[arg(long, env = "DEALPATH_TIMEOUT_SECS")]
    pub dealpath_timeout_secs: Option<u64>,

    /// remote_only, proxy_stream or local_cache
    #[arg(long, env = "FILE_DOWNLOAD_STRATEGY")]
    pub file_download_strategy: Option<String>,

    #[arg(long, env = "FILE_STORAGE_DIR")]
    pub file_storage_dir: Option<PathBuf>,

    #[arg(long, env = "FILE_CACHE_TTL_HOURS")]
    pub file_cache_ttl_hours: Option<u64>,

    #[arg(long, env = "FILE_CACHE_MAX_BYTES")]
    pub file_cache_max_bytes: Option<u64>,

    #[arg(long, env = "FILE_CACHE_MAX_FILES")]
    pub file_cache_max_files: Option<usize>,

    #[arg(long, env = "FILE_CACHE_SWEEP_SECONDS")]
    pub file_cache_sweep_seconds: Option<u64>,

    #[arg(long, env = "SESSION_IDLE_TIMEOUT_SECS")]
    pub session_idle_timeout_secs: Option<u64>,

    #[arg(long, env = "SESSION_SWEEP_SECONDS")]
    pub session_sweep_seconds: Option<u64>,
}

impl ServerConfig {
    /// Read `config_path` if it exists, otherwise start from defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read configuration file {}", config_path.display()))?;
            Self::from_toml(&content)
        } else {
            tracing::info!(path = %config_path.display(), "Configuration file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    /// Apply overrides, then reject values that can never work.
    pub fn with_overrides(mut self, o: ConfigOverrides) -> Result<Self> {
        if let Some(host) = o.host {
            self.http.host = host;
        }
        if let Some(port) = o.port {
            self.http.port = port;
        }
        if let Some(url) = o.public_base_url {
            self.http.public_base_url = Some(url);
        }
        if let Some(token) = o.mcp_token.filter(|t| !t.trim().is_empty()) {
            self.auth.token = Some(SecretString::from(token.trim().to_string()));
        }
        if let Some(origins) = o.allowed_origins {
            self.auth.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(key) = Credential::from_optional(o.dealpath_key.as_deref()) {
            self.dealpath_key = Some(key);
        }

        let upstream = &mut self.gateway.upstream;
        if let Some(url) = o.dealpath_base_url {
            upstream.base_url = url;
        }
        if let Some(secs) = o.dealpath_timeout_secs {
            upstream.timeout_secs = secs;
        }

        let files = &mut self.gateway.files;
        if let Some(raw) = o.file_download_strategy {
            files.strategy = raw.parse::<FileDownloadStrategy>()?;
        }
        if let Some(dir) = o.file_storage_dir {
            files.storage_dir = dir;
        }
        if let Some(hours) = o.file_cache_ttl_hours {
            files.cache_ttl_hours = hours;
        }
        if let Some(bytes) = o.file_cache_max_bytes {
            files.cache_max_bytes = bytes;
        }
        if let Some(count) = o.file_cache_max_files {
            files.cache_max_files = count;
        }
        if let Some(secs) = o.file_cache_sweep_seconds {
            files.sweep_interval_secs = secs;
        }

        let sessions = &mut self.gateway.sessions;
        if let Some(secs) = o.session_idle_timeout_secs {
            sessions.idle_timeout_secs = secs;
        }
        if let Some(secs) = o.session_sweep_seconds {
            sessions.sweep_interval_secs = secs;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.gateway.validate()?;
        if let Some(url) = &self.http.public_base_url {
            url::Url::parse(url).with_context(|| format!("invalid PUBLIC_BASE_URL '{}'", url))?;
        }
        Ok(())
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub mcp: McpServer,
    pub api: Arc<dyn DealpathApi>,
    pub delivery: Arc<FileDelivery>,
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<AuthGuard>,
    public_base_url: Option<String>,
    bind_addr: String,
}

impl AppState {
    /// Wire the upstream client, session table, file delivery and dispatcher.
    /// Storage problems surface here, before the listener binds.
    pub async fn build(config: &ServerConfig) -> Result<Self> {
        let upstream = HttpUpstream::new(&config.gateway.upstream).context("Failed to create upstream client")?;
        let api: Arc<dyn DealpathApi> = Arc::new(upstream);

        let sessions = Arc::new(SessionManager::new(
            config.dealpath_key.clone(),
            config.gateway.sessions.idle_timeout(),
        ));
        let delivery = Arc::new(
            FileDelivery::new(&config.gateway.files, api.clone(), config.gateway.upstream.timeout())
                .await
                .context("Failed to initialise file delivery")?,
        );
        let mcp = McpServer::with_default_catalog(api.clone(), delivery.clone(), sessions.clone())
            .context("Failed to build tool registry")?;

        let auth = Arc::new(AuthGuard::new(
            config.auth.token.as_ref().map(|t| t.expose_secret()),
            config.auth.allowed_origins.clone(),
        ));

        if !sessions.has_server_default() {
            tracing::info!("DEALPATH_KEY not set; clients must supply their own credential");
        }

        Ok(Self {
            mcp,
            api,
            delivery,
            sessions,
            auth,
            public_base_url: config
                .http
                .public_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            bind_addr: config.http.bind_addr(),
        })
    }

    /// Base URL for links: configured value, else the request's `Host`.
    pub fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(url) = &self.public_base_url {
            return url.clone();
        }
        let host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| is_plain_host(h))
            .unwrap_or(self.bind_addr.as_str());
        format!("http://{}", host)
    }
}

fn is_plain_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_toml_sections_and_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            [http]
            port = 9000

            [files]
            strategy = "local_cache"
            cache_max_files = 5

            [upstream]
            timeout_secs = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.http.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.gateway.files.strategy, FileDownloadStrategy::LocalCache);
        assert_eq!(config.gateway.files.cache_max_files, 5);
        assert_eq!(config.gateway.files.cache_ttl_hours, 24);
        assert_eq!(config.gateway.upstream.timeout_secs, 7);
        assert_eq!(config.auth.allowed_origins, default_allowed_origins());
        assert!(config.auth.token.is_none());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let config = ServerConfig::from_toml("[files]\nstrategy = \"local_cache\"\n")
            .unwrap()
            .with_overrides(ConfigOverrides {
                file_download_strategy: Some("proxy_stream".into()),
                allowed_origins: Some("http://a.example, ,http://b.example".into()),
                mcp_token: Some("  ".into()),
                dealpath_key: Some("key".into()),
                port: Some(1234),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.gateway.files.strategy, FileDownloadStrategy::ProxyStream);
        assert_eq!(config.auth.allowed_origins, vec!["http://a.example", "http://b.example"]);
        assert!(config.auth.token.is_none());
        assert_eq!(config.dealpath_key.unwrap().expose(), "key");
        assert_eq!(config.http.port, 1234);
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        let bad_strategy = ServerConfig::default().with_overrides(ConfigOverrides {
            file_download_strategy: Some("carrier_pigeon".into()),
            ..Default::default()
        });
        assert!(bad_strategy.is_err());

        let bad_url = ServerConfig::default().with_overrides(ConfigOverrides {
            dealpath_base_url: Some("not a url".into()),
            ..Default::default()
        });
        assert!(bad_url.is_err());

        let zero_ttl = ServerConfig::default().with_overrides(ConfigOverrides {
            file_cache_ttl_hours: Some(0),
            ..Default::default()
        });
        assert!(zero_ttl.is_err());

        let huge_ttl = ServerConfig::default().with_overrides(ConfigOverrides {
            file_cache_ttl_hours: Some(10_000_000_000),
            ..Default::default()
        });
        assert!(huge_ttl.is_err());

        let huge_idle = ServerConfig::default().with_overrides(ConfigOverrides {
            session_idle_timeout_secs: Some(u64::MAX),
            ..Default::default()
        });
        assert!(huge_idle.is_err());
    }

    #[tokio::test]
    async fn test_base_url_prefers_configured_then_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.gateway.files.storage_dir = dir.path().join("files");
        let state = AppState::build(&config).await.unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(state.base_url(&headers), "http://127.0.0.1:8000");
        headers.insert(HOST, HeaderValue::from_static("gateway.local:8080"));
        assert_eq!(state.base_url(&headers), "http://gateway.local:8080");
        headers.insert(HOST, HeaderValue::from_static("evil.example/path?x"));
        assert_eq!(state.base_url(&headers), "http://127.0.0.1:8000");

        config.http.public_base_url = Some("https://deals.example.com/".into());
        let state = AppState::build(&config).await.unwrap();
        assert_eq!(state.base_url(&headers), "https://deals.example.com");
    }
}
