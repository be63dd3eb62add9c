//! Configuration for the streaming subsystem.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $WEIR_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/weir/config.toml
//!   3. ~/.config/weir/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Streaming subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Capacity of each priority-queue level. A push to a full level is
    /// rejected, not queued.
    pub queue_capacity: usize,

    /// Depth of the delivered-chunk receive channel.
    pub receive_depth: usize,

    /// Seconds to wait for a requested chunk before giving up.
    pub retrieve_timeout_secs: u64,

    /// Maximum hashes in a single offered batch.
    pub max_batch_hashes: usize,

    /// How many ready chunks the retrieve stream folds into one offer.
    pub delivery_batch_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            receive_depth: 10,
            retrieve_timeout_secs: 180,
            max_batch_hashes: 128,
            delivery_batch_depth: 32,
        }
    }
}

impl StreamConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            StreamConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("WEIR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StreamConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The retrieve timeout as a [`Duration`].
    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieve_timeout_secs)
    }

    /// Apply WEIR_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEIR_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.queue_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("WEIR_RECEIVE_DEPTH") {
            if let Ok(n) = v.parse() {
                self.receive_depth = n;
            }
        }
        if let Ok(v) = std::env::var("WEIR_RETRIEVE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.retrieve_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("WEIR_MAX_BATCH_HASHES") {
            if let Ok(n) = v.parse() {
                self.max_batch_hashes = n;
            }
        }
        if let Ok(v) = std::env::var("WEIR_DELIVERY_BATCH_DEPTH") {
            if let Ok(n) = v.parse() {
                self.delivery_batch_depth = n;
            }
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("weir")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = StreamConfig::default();
        assert!(config.queue_capacity > 0);
        assert!(config.receive_depth > 0);
        assert_eq!(config.retrieve_timeout(), Duration::from_secs(180));
        assert!(config.delivery_batch_depth <= config.max_batch_hashes);
    }

    #[test]
    fn toml_roundtrip_preserves_fields() {
        let config = StreamConfig {
            queue_capacity: 7,
            receive_depth: 3,
            retrieve_timeout_secs: 5,
            max_batch_hashes: 16,
            delivery_batch_depth: 4,
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: StreamConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.queue_capacity, 7);
        assert_eq!(back.retrieve_timeout_secs, 5);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let back: StreamConfig = toml::from_str("queue_capacity = 9").unwrap();
        assert_eq!(back.queue_capacity, 9);
        assert_eq!(back.receive_depth, StreamConfig::default().receive_depth);
    }
}
