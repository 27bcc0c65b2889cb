use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::folders::FolderRule;

pub const USER_PLACEHOLDER: &str = "%%USER%%";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Must specify a value for '{0}' in config file")]
    Missing(String),

    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },

    #[error("No password for {login} in config or keyring: {reason}")]
    Password { login: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminLoginMode {
    /// LOGIN as the admin, then `PROXYAUTH <user>`.
    #[default]
    Proxyauth,
    /// SASL PLAIN with the account user as authorization identity.
    SaslPlain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSettings {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub mode: AdminLoginMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default = "default_user_pattern")]
    pub user_pattern: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub admin: Option<AdminSettings>,
}

impl ServerSettings {
    pub fn port(&self) -> u16 {
        match (self.port, self.use_tls) {
            (Some(port), _) => port,
            (None, true) => 993,
            (None, false) => 143,
        }
    }

    /// Login name for a user listed in the accounts file.
    pub fn login_for(&self, user: &str) -> String {
        self.user_pattern.replace(USER_PLACEHOLDER, user)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingStoreSettings {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: ServerSettings,
    pub destination: ServerSettings,
    #[serde(default)]
    pub tracking_store: TrackingStoreSettings,
    pub accounts_file: String,
    #[serde(default)]
    pub run_log: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub folder_map: Option<Vec<FolderRule>>,
}

fn default_true() -> bool {
    true
}

fn default_user_pattern() -> String {
    USER_PLACEHOLDER.to_string()
}

fn default_timeout_secs() -> u64 {
    45
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);
        let content = fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (prefix, server) in [("source", &self.source), ("destination", &self.destination)] {
            if server.hostname.trim().is_empty() {
                return Err(ConfigError::Missing(format!("{}.hostname", prefix)));
            }
            if server.admin.is_none() && !server.user_pattern.contains(USER_PLACEHOLDER) {
                return Err(ConfigError::Invalid {
                    key: format!("{}.user_pattern", prefix),
                    reason: format!("must contain {}", USER_PLACEHOLDER),
                });
            }
        }
        if self.accounts_file.trim().is_empty() {
            return Err(ConfigError::Missing("accounts_file".to_string()));
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "connect_timeout_secs/read_timeout_secs".to_string(),
                reason: "timeouts must be greater than zero".to_string(),
            });
        }
        if self.tracking_store.max_connections == Some(0) {
            return Err(ConfigError::Invalid {
                key: "tracking_store.max_connections".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn accounts_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.accounts_file).into_owned())
    }

    pub fn tracking_store_path(&self) -> PathBuf {
        match &self.tracking_store.path {
            Some(path) => PathBuf::from(shellexpand::tilde(path).into_owned()),
            None => dirs::data_dir()
                .unwrap_or_default()
                .join("imapmigrate")
                .join("tracking.db"),
        }
    }

    /// Pool size for the tracking store; never smaller than the worker count.
    pub fn tracking_store_connections(&self, workers: usize) -> u32 {
        let wanted = self.tracking_store.max_connections.unwrap_or(4);
        wanted.max(workers as u32).max(1)
    }

    pub fn run_log_pattern(&self) -> Option<String> {
        self.run_log
            .as_ref()
            .map(|pattern| shellexpand::tilde(pattern).into_owned())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}
