//! Configuration management module for the tunnel manager.
//!
//! This module provides functionality for loading, parsing, validating and
//! saving the TOML configuration shared by the manager service and its
//! command-line front end.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manager service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagerConfig {
    /// Path of the Unix Domain Socket the service listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// User IDs whose sessions are elevated
    #[serde(default)]
    pub admin_uids: Vec<u32>,

    /// Group IDs whose members' sessions are elevated
    #[serde(default)]
    pub admin_gids: Vec<u32>,

    /// Elevate sessions opened by root (default: true)
    #[serde(default = "default_true")]
    pub allow_root: bool,

    /// Keep checking for updates even when this is not an official build
    #[serde(default)]
    pub allow_unofficial_updates: bool,

    /// Optional TOML manifest describing the latest release
    #[serde(default)]
    pub update_manifest: Option<PathBuf>,

    /// Write deadline for one notification delivery, in milliseconds
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,

    /// Time allowed for a client hello and for pairing both session
    /// connections, in milliseconds
    #[serde(default = "default_pairing_timeout_ms")]
    pub pairing_timeout_ms: u64,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/tunnel-manager/manager.sock")
}

fn default_true() -> bool {
    true
}

fn default_broadcast_timeout_ms() -> u64 {
    1_000
}

fn default_pairing_timeout_ms() -> u64 {
    5_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            socket_path: default_socket_path(),
            admin_uids: Vec::new(),
            admin_gids: Vec::new(),
            allow_root: default_true(),
            allow_unofficial_updates: false,
            update_manifest: None,
            broadcast_timeout_ms: default_broadcast_timeout_ms(),
            pairing_timeout_ms: default_pairing_timeout_ms(),
        }
    }
}

impl ManagerConfig {
    /// Returns the broadcast write deadline as a [`Duration`].
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    /// Returns the pairing timeout as a [`Duration`].
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Manager service configuration
    #[serde(default)]
    pub manager: ManagerConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            manager: ManagerConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        // Environment variables take precedence over the file
        config.with_env_overrides()
    }

    /// Apply environment overrides and re-validate
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        Self::apply_env_overrides(&mut self);
        self.validate()?;
        Ok(self)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "log_level".to_string(),
                message: format!("must be one of {}", LOG_LEVELS.join(", ")),
            });
        }

        if self.manager.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "manager.socket_path".to_string(),
                message: "socket path cannot be empty".to_string(),
            });
        }

        if self.manager.broadcast_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "manager.broadcast_timeout_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.manager.pairing_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "manager.pairing_timeout_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: TUNNEL_MANAGER_)
    /// Keys:
    /// - TUNNEL_MANAGER_LOG_LEVEL, TUNNEL_MANAGER_SOCKET_PATH
    /// - TUNNEL_MANAGER_ADMIN_UIDS, TUNNEL_MANAGER_ADMIN_GIDS, TUNNEL_MANAGER_ALLOW_ROOT
    /// - TUNNEL_MANAGER_ALLOW_DEV_UPDATES, TUNNEL_MANAGER_UPDATE_MANIFEST
    fn apply_env_overrides(cfg: &mut Config) {
        use std::env;

        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }
        fn split_csv_u32(s: &str) -> Vec<u32> {
            s.split(',')
                .filter_map(|v| v.trim().parse::<u32>().ok())
                .collect()
        }

        if let Ok(v) = env::var("TUNNEL_MANAGER_LOG_LEVEL") {
            if !v.is_empty() {
                cfg.log_level = v;
            }
        }
        if let Ok(v) = env::var("TUNNEL_MANAGER_SOCKET_PATH") {
            if !v.is_empty() {
                cfg.manager.socket_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = env::var("TUNNEL_MANAGER_ADMIN_UIDS") {
            cfg.manager.admin_uids = split_csv_u32(&v);
        }
        if let Ok(v) = env::var("TUNNEL_MANAGER_ADMIN_GIDS") {
            cfg.manager.admin_gids = split_csv_u32(&v);
        }
        if let Ok(v) = env::var("TUNNEL_MANAGER_ALLOW_ROOT") {
            if let Some(b) = parse_bool(&v) {
                cfg.manager.allow_root = b;
            }
        }
        if let Ok(v) = env::var("TUNNEL_MANAGER_ALLOW_DEV_UPDATES") {
            if let Some(b) = parse_bool(&v) {
                cfg.manager.allow_unofficial_updates = b;
            }
        }
        if let Ok(v) = env::var("TUNNEL_MANAGER_UPDATE_MANIFEST") {
            if !v.is_empty() {
                cfg.manager.update_manifest = Some(PathBuf::from(v));
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tunnel-manager").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}
