use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::auth::OAuth2Settings;

/// API connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API base URL (can also be set via NIMBUS_BASE_URL env var)
    pub base_url: String,
    /// User-Agent sent with every API request
    pub user_agent: String,
    /// Skip TLS certificate verification (test deployments only)
    pub accept_invalid_certs: bool,
    /// Request timeout in seconds, 0 for no timeout
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://app.nimbus.cloud".to_string(),
            user_agent: concat!("nimbus-client/", env!("CARGO_PKG_VERSION")).to_string(),
            accept_invalid_certs: false,
            timeout_secs: 60,
        }
    }
}

/// OAuth2 client registration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OAuth2Config {
    /// OAuth2 client ID
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: String,
    /// Scopes to request
    pub scopes: Vec<String>,
    /// Redirect URL registered for the client
    pub redirect_url: String,
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            scopes: vec!["public".to_string()],
            redirect_url: "http://localhost:1337".to_string(),
        }
    }
}

impl OAuth2Config {
    /// Whether a client ID and secret are present.
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn settings(&self) -> OAuth2Settings {
        OAuth2Settings::new(
            self.client_id.clone(),
            self.client_secret.clone(),
            self.scopes.clone(),
            self.redirect_url.clone(),
        )
    }
}

/// Main client configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub oauth2: OAuth2Config,
}

impl Config {
    /// Returns the default config file path: ~/.config/nimbus/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("nimbus").join("config.toml"))
    }

    /// Load configuration from the default path, falling back to defaults,
    /// then apply environment overrides.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from_path(&path).ok())
            .unwrap_or_default()
            .with_env_overrides()
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(path) = Self::default_path() {
            self.save_to_path(&path)
        } else {
            Err(anyhow::anyhow!("Could not determine config directory"))
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override individual fields from `NIMBUS_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("NIMBUS_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = lookup("NIMBUS_OAUTH2_CLIENT_ID") {
            self.oauth2.client_id = v;
        }
        if let Some(v) = lookup("NIMBUS_OAUTH2_CLIENT_SECRET") {
            self.oauth2.client_secret = v;
        }
        if let Some(v) = lookup("NIMBUS_OAUTH2_REDIRECT_URL") {
            self.oauth2.redirect_url = v;
        }
        self
    }
}
