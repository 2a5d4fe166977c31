//! Configuration
//!
//! JSON configuration file plus environment overrides. The file lives at
//! `~/.carryover/config.json` by default; `CARRYOVER_CONFIG_PATH` points
//! elsewhere. A missing file yields the defaults (durable sqlite storage
//! next to the config). The platform token can be supplied via
//! `CARRYOVER_PLATFORM_TOKEN` instead of the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-request timeout for platform calls, seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Durable single-file database.
    #[default]
    Sqlite,
    /// Process-local, lost on restart. Development only.
    Memory,
}

/// Storage section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file path; defaults to `carryover.db` in the state dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved database path for the sqlite backend.
    pub fn sqlite_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| state_dir().join("carryover.db"))
    }
}

/// Chat platform section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Platform API base URL, e.g. `https://chat.example.com`.
    #[serde(default)]
    pub base_url: String,
    /// Bot access token. `CARRYOVER_PLATFORM_TOKEN` overrides.
    #[serde(default)]
    pub token: String,
    /// Per-request timeout, seconds.
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

impl Config {
    /// Load from the resolved config path, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Load from an explicit path. A missing file is the default config.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("CARRYOVER_PLATFORM_TOKEN") {
            self.platform.token = token;
        }
        if let Ok(base_url) = env::var("CARRYOVER_PLATFORM_URL") {
            self.platform.base_url = base_url;
        }
    }
}

/// State directory: `~/.carryover`, or the current directory as a last
/// resort.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".carryover")
}

/// Config file path. Priority: `CARRYOVER_CONFIG_PATH` > state dir.
pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var("CARRYOVER_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    state_dir().join("config.json")
}
