//! Configuration loading

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tunables for an editing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period after the last local edit before a flush (default: 2s)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Prefix of every room id
    #[serde(default = "default_room_prefix")]
    pub room_prefix: String,

    /// Typing flag clears after this long without input
    #[serde(default = "default_typing_idle_ms")]
    pub typing_idle_ms: u64,

    /// How long joining a room waits for an existing member's document
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// WebSocket relay endpoint (None = no replication backend configured)
    #[serde(default)]
    pub relay_url: Option<String>,
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_room_prefix() -> String {
    "notes".to_string()
}

fn default_typing_idle_ms() -> u64 {
    1500
}

fn default_sync_timeout_ms() -> u64 {
    1000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            room_prefix: default_room_prefix(),
            typing_idle_ms: default_typing_idle_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            relay_url: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file, writing the defaults there if it
    /// does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            info!("Loaded configuration from {:?}", path);
            return Ok(config);
        }

        info!("No config file found at {:?}, using defaults", path);
        let config = SyncConfig::default();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(&config).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Created default config at {:?}", path);

        Ok(config)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
