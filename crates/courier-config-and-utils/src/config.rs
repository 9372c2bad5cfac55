//! Configuration management for the client.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default homeserver base URL.
pub const DEFAULT_HOMESERVER_URL: &str = "https://matrix.org";

/// Default per-request timeout for the homeserver transport.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// HTTP statuses after which a pending event is dropped instead of retried.
pub const DEFAULT_PERMANENT_STATUSES: [u16; 3] = [400, 403, 404];

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Homeserver base URL.
    #[serde(default = "default_homeserver_url")]
    pub homeserver_url: String,
    /// Access token for the homeserver (usually injected via environment).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// HTTP statuses treated as permanent rejection.
    #[serde(default = "default_permanent_statuses")]
    pub permanent_statuses: Vec<u16>,
}

fn default_homeserver_url() -> String {
    DEFAULT_HOMESERVER_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_permanent_statuses() -> Vec<u16> {
    DEFAULT_PERMANENT_STATUSES.to_vec()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            homeserver_url: default_homeserver_url(),
            access_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            permanent_statuses: default_permanent_statuses(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file. The access token is never written.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let persisted = Self {
            access_token: None,
            ..self.clone()
        };
        let content = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("COURIER_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(url) = std::env::var("COURIER_HOMESERVER_URL") {
            self.homeserver_url = url;
        }
        if let Ok(token) = std::env::var("COURIER_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                self.access_token = Some(token.trim().to_string());
            }
        }
    }

    fn validate(&self) -> CoreResult<()> {
        self.homeserver_url()?;
        if self.request_timeout_secs == 0 {
            return Err(CoreError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the homeserver URL as a parsed URL.
    pub fn homeserver_url(&self) -> CoreResult<Url> {
        Url::parse(&self.homeserver_url).map_err(CoreError::from)
    }

    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
