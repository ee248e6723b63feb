//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret comes from OIDC_CLIENT_SECRET or client_secret_file and
//! the state signing key from OIDC_STATE_SIGNING_KEY; neither is ever read
//! from the TOML itself.

use common::Secret;
use oidc_client::{ClientSettings, HttpOptions};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use token_storage::{DEFAULT_KEY_PREFIX, StorageDriver};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub provider: ProviderSection,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Externally visible base URL, used in log lines only
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Relying-party client settings plus where to find the client secret
#[derive(Debug, Deserialize)]
pub struct ProviderSection {
    #[serde(flatten)]
    pub settings: ClientSettings,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
}

/// Outbound HTTP transport settings
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            verify_peer: default_verify_peer(),
            proxy: None,
            client_cert: None,
        }
    }
}

impl HttpConfig {
    pub fn options(&self) -> HttpOptions {
        HttpOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            verify_peer: self.verify_peer,
            proxy: self.proxy.clone(),
            client_cert: self.client_cert.clone(),
        }
    }
}

/// Where authorization state lives between login and callback
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub driver: StorageDriver,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Lifetime of cache entries; 0 keeps them until removed
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Persist sessions as JSON files here instead of keeping them in memory
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    /// Browser sessions untouched this long are dropped from memory
    #[serde(default = "default_session_idle")]
    pub session_idle_secs: u64,
    /// Upper bound on browser sessions held in memory
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(skip)]
    pub state_signing_key: Option<Secret<String>>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: StorageDriver::default(),
            key_prefix: default_key_prefix(),
            cache_ttl_secs: default_cache_ttl(),
            session_dir: None,
            session_idle_secs: default_session_idle(),
            max_sessions: default_max_sessions(),
            state_signing_key: None,
        }
    }
}

impl StorageConfig {
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_verify_peer() -> bool {
    true
}

fn default_max_connections() -> usize {
    1000
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_session_idle() -> u64 {
    3600
}

fn default_max_sessions() -> usize {
    10_000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OIDC_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        validate_http_url("provider_url", &config.provider.settings.provider_url)?;
        validate_http_url("redirect_url", &config.provider.settings.redirect_url)?;
        if let Some(public_url) = &config.server.public_url {
            validate_http_url("public_url", public_url)?;
        }

        if config.provider.settings.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        if config.http.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.storage.session_idle_secs == 0 || config.storage.max_sessions == 0 {
            return Err(common::Error::Config(
                "session_idle_secs and max_sessions must be greater than 0".into(),
            ));
        }

        // Env var takes precedence over file
        if let Ok(secret) = std::env::var("OIDC_CLIENT_SECRET") {
            config.provider.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.provider.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.provider.client_secret = Some(Secret::new(secret));
            }
        }
        if config.provider.client_secret.as_ref().is_none_or(Secret::is_empty) {
            return Err(common::Error::MissingSecret(
                "set OIDC_CLIENT_SECRET or provider.client_secret_file".into(),
            ));
        }

        if let Ok(key) = std::env::var("OIDC_STATE_SIGNING_KEY")
            && !key.is_empty()
        {
            config.storage.state_signing_key = Some(Secret::new(key));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oidc-gateway.toml")
    }
}

fn validate_http_url(field: &str, value: &str) -> common::Result<()> {
    let url = url::Url::parse(value)
        .map_err(|e| common::Error::Config(format!("{field} is not a valid URL ({value}): {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}
