use std::path::PathBuf;
use clap::{Parser, ValueEnum};

use crate::config::RagWatchConfig;

#[derive(Parser)]
#[command(name = "rag-watch")]
#[command(version)]
#[command(about = "Incremental change feed for code indexing")]
#[command(long_about = "rag-watch watches a source tree and reports created, modified, deleted and renamed code files in debounced batches. Content hashes suppress no-op writes, inode tracking recovers renames, and an optional hash store carries state across restarts.")]
pub struct Cli {
    /// Directory to watch for changes
    #[arg(value_name = "PATH", help = "Path to watch (defaults to current directory)")]
    pub path: Option<PathBuf>,

    /// Persist content hashes across runs
    #[arg(long, value_name = "FILE", help = "Hash store file")]
    pub store: Option<PathBuf>,

    /// Collection name used for last-index bookkeeping
    #[arg(long, help = "Collection name in the hash store")]
    pub collection: Option<String>,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", help = "TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Flush interval in ms")]
    pub debounce_ms: Option<u64>,

    #[arg(long, help = "Maximum changes per batch")]
    pub batch_size: Option<usize>,

    #[arg(long, help = "Rename correlation window in ms")]
    pub rename_window_ms: Option<u64>,

    /// Exclude patterns beyond the built-in list
    #[arg(long, value_delimiter = ',', help = "Additional patterns to exclude")]
    pub exclude: Option<Vec<String>>,

    #[arg(long, default_value = "text", help = "Output format")]
    pub output: OutputFormat,

    /// Compare the tree with the hash store and exit
    #[arg(long, help = "Print changes since the last run and exit")]
    pub status: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Disable colors in output
    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    Text,
    /// JSON output for scripting, one batch per line
    Json,
    /// Compact single-line format
    Compact,
}

impl Cli {
    pub fn get_watch_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_ansi(!self.no_color)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }

    /// Configuration file and environment, overridden by command-line flags.
    pub fn resolve_config(&self) -> anyhow::Result<RagWatchConfig> {
        let mut config = RagWatchConfig::load_or_default(self.config.as_deref())?;

        if let Some(ms) = self.debounce_ms {
            config.watcher.debounce_ms = ms;
        }
        if let Some(size) = self.batch_size {
            config.watcher.batch_size = size;
        }
        if let Some(ms) = self.rename_window_ms {
            config.watcher.rename_window_ms = ms;
        }
        if let Some(patterns) = &self.exclude {
            config.watcher.exclude_patterns.extend(patterns.iter().cloned());
        }
        if let Some(store) = &self.store {
            config.store.path = Some(store.clone());
        }
        if let Some(collection) = &self.collection {
            config.store.collection = collection.clone();
        }

        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let path = self.get_watch_path();

        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()));
        }

        if !path.is_dir() {
            return Err(format!("Path is not a directory: {}", path.display()));
        }

        if self.status && self.store.is_none() && std::env::var_os("RAG_WATCH_STORE_PATH").is_none() && self.config.is_none() {
            return Err("--status needs a hash store (--store or config)".to_string());
        }

        Ok(())
    }
}
