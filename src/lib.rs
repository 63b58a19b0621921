pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod hash;
pub mod inode;
pub mod queue;
pub mod rename;
pub mod store;
pub mod watcher;

pub use config::{RagWatchConfig, StoreOptions, WatcherOptions};
pub use error::{StoreError, StoreResult, WatchError, WatchResult};
pub use events::*;
pub use filter::{is_code_file, FileFilter, DEFAULT_EXCLUDES};
pub use hash::{content_hash, HashCache};
pub use inode::FileId;
pub use rename::{DeleteInfo, RenameTracker, TrackerStats};
pub use store::{ChangeSet, FileHashEntry, HashStore};
pub use watcher::{ChangeHandler, Watcher, WatcherStats};
