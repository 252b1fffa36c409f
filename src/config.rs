//! Client configuration
//!
//! Loaded from a TOML file. Only `[cloud]` is required; every other value
//! has a default that matches the public Blynk cloud.
//!
//! ```toml
//! [cloud]
//! auth_token_env = "BLYNK_AUTH_TOKEN"
//! server = "blynk.cloud"
//! port = 443
//! heartbeat_secs = 50
//!
//! [service]
//! read_timeout_ms = 1000
//! ```

use crate::transport::{Endpoint, TransportSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Paths searched, in order, when no config file is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["blynk.toml", "config/blynk.toml"];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub cloud: CloudSection,
    #[serde(default)]
    pub service: ServiceSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudSection {
    /// Device auth token, inline. Takes precedence over `auth_token_env`.
    pub auth_token: Option<String>,
    /// Environment variable holding the device auth token
    pub auth_token_env: Option<String>,
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Plain TCP instead of TLS
    #[serde(default)]
    pub insecure: bool,
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Maximum bytes taken from the transport per tick
    #[serde(default = "default_buffer_in")]
    pub buffer_in: usize,
}

/// Service loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Pause between ticks while nothing is happening
    #[serde(default = "default_idle_pause_ms")]
    pub idle_pause_ms: u64,
    /// Pause after a fatal transport error
    #[serde(default = "default_error_pause_ms")]
    pub error_pause_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            idle_pause_ms: default_idle_pause_ms(),
            error_pause_ms: default_error_pause_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_server() -> String {
    "blynk.cloud".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_heartbeat_secs() -> u64 {
    50
}

fn default_buffer_in() -> usize {
    1024
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_idle_pause_ms() -> u64 {
    50
}

fn default_error_pause_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("No auth token configured (set cloud.auth_token or cloud.auth_token_env)")]
    MissingAuthToken,
    #[error("No config file found in: {0}")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Config for a token with every other value defaulted
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            cloud: CloudSection {
                auth_token: Some(token.into()),
                auth_token_env: None,
                server: default_server(),
                port: default_port(),
                insecure: false,
                heartbeat_secs: default_heartbeat_secs(),
                buffer_in: default_buffer_in(),
            },
            service: ServiceSection::default(),
        }
    }

    /// Check value ranges. The token itself is resolved lazily.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cloud = &self.cloud;
        if cloud.auth_token.is_none() && cloud.auth_token_env.is_none() {
            return Err(ConfigError::MissingAuthToken);
        }
        if cloud.auth_token.as_deref() == Some("") {
            return Err(ConfigError::InvalidConfig(
                "cloud.auth_token must not be empty".to_string(),
            ));
        }
        if cloud.server.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "cloud.server must not be empty".to_string(),
            ));
        }
        if cloud.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "cloud.port must be non-zero".to_string(),
            ));
        }
        if cloud.heartbeat_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "cloud.heartbeat_secs must be at least 1".to_string(),
            ));
        }
        if cloud.buffer_in == 0 {
            return Err(ConfigError::InvalidConfig(
                "cloud.buffer_in must be at least 1".to_string(),
            ));
        }
        if self.service.read_timeout_ms == 0 || self.service.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "service timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the device auth token, inline value first
    pub fn auth_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.cloud.auth_token {
            return Ok(token.clone());
        }
        let var = self
            .cloud
            .auth_token_env
            .as_deref()
            .ok_or(ConfigError::MissingAuthToken)?;
        match std::env::var(var) {
            Ok(token) if !token.is_empty() => Ok(token),
            _ => Err(ConfigError::EnvVarNotFound(var.to_string())),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.cloud.server, self.cloud.port, !self.cloud.insecure)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.cloud.heartbeat_secs)
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            read_timeout: Duration::from_millis(self.service.read_timeout_ms),
            connect_timeout: Duration::from_secs(self.service.connect_timeout_secs),
            ..Default::default()
        }
    }

    pub fn idle_pause(&self) -> Duration {
        Duration::from_millis(self.service.idle_pause_ms)
    }

    pub fn error_pause(&self) -> Duration {
        Duration::from_millis(self.service.error_pause_ms)
    }

    /// Copy safe for printing: the inline token is masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(token) = copy.cloud.auth_token.as_mut() {
            *token = redact(token);
        }
        copy
    }
}

/// Keep the first four characters of a secret
fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}***")
}

/// Locate a config file: the explicit path if given, otherwise the first
/// existing default path
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
}
