//! Error types for the watcher and the hash store

use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by [`crate::HashStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another process holds the store file open
    #[error("hash store {path} is locked by another process (waited {waited:?})")]
    Locked { path: PathBuf, waited: Duration },

    #[error("hash store database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("hash store transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("hash store table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("hash store storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("hash store commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// A stored entry could not be encoded or decoded
    #[error("corrupt hash entry for {key}: {source}")]
    Encoding {
        key: String,
        source: serde_json::Error,
    },
}

/// Errors surfaced by [`crate::Watcher`] entry points.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch root does not exist or is not a directory: {0}")]
    InvalidRoot(PathBuf),

    #[error("failed to create filesystem watcher: {0}")]
    Notify(#[from] notify::Error),

    #[error("watcher is already running")]
    AlreadyStarted,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type WatchResult<T> = Result<T, WatchError>;
