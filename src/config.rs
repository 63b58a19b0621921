//! Configuration management for rag-watch
//!
//! This module provides configuration structures and defaults for the file
//! watcher and the persistent hash store.

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagWatchConfig {
    /// File watcher configuration
    pub watcher: WatcherOptions,
    /// Hash store configuration
    pub store: StoreOptions,
}

/// Tuning for [`crate::Watcher`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherOptions {
    /// Interval between batch flushes in milliseconds
    pub debounce_ms: u64,
    /// Maximum number of changes handed to the handler per flush
    pub batch_size: usize,
    /// How long a deletion waits for a matching creation, in milliseconds
    pub rename_window_ms: u64,
    /// Patterns excluded in addition to the built-in list
    pub exclude_patterns: Vec<String>,
}

/// Location and identity of the persistent hash store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Store file; no persistence when unset
    pub path: Option<PathBuf>,
    /// Collection name used for last-index bookkeeping
    pub collection: String,
    /// How long to wait for another process to release the store
    pub open_timeout_ms: u64,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            batch_size: 100,
            rename_window_ms: 500,
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: None,
            collection: "default".to_string(),
            open_timeout_ms: 1000,
        }
    }
}

impl WatcherOptions {
    /// Get flush interval duration
    pub fn debounce_duration(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Get rename correlation window duration
    pub fn rename_window(&self) -> Duration {
        Duration::from_millis(self.rename_window_ms)
    }
}

impl StoreOptions {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Configuration loading and management
impl RagWatchConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load from `path` when given, otherwise use defaults, then apply
    /// environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("RAG_WATCH_DEBOUNCE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.watcher.debounce_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("RAG_WATCH_BATCH_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                self.watcher.batch_size = size;
            }
        }

        if let Ok(val) = std::env::var("RAG_WATCH_RENAME_WINDOW_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.watcher.rename_window_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("RAG_WATCH_STORE_PATH") {
            if !val.is_empty() {
                self.store.path = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = std::env::var("RAG_WATCH_COLLECTION") {
            if !val.is_empty() {
                self.store.collection = val;
            }
        }

        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.watcher.debounce_ms == 0 {
            return Err("debounce_ms must be greater than 0".to_string());
        }

        if self.watcher.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }

        if self.watcher.rename_window_ms == 0 {
            return Err("rename_window_ms must be greater than 0".to_string());
        }

        if self.store.collection.trim().is_empty() {
            return Err("collection must not be empty".to_string());
        }

        Ok(())
    }
}
