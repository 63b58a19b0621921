//! Persistent per-file content fingerprints
//!
//! Backed by a single redb file with two tables: `file_hashes`, keyed by
//! absolute path, and `metadata` for per-collection bookkeeping. The file is
//! exclusively locked while open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

const FILE_HASHES: TableDefinition<&str, &[u8]> = TableDefinition::new("file_hashes");
const METADATA: TableDefinition<&str, i64> = TableDefinition::new("metadata");

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashEntry {
    pub hash: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// Result of diffing a fresh hash map against the stored one. The three
/// sets are disjoint and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub created: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }
}

pub struct HashStore {
    db: Database,
    path: PathBuf,
}

/// Keys are stored as UTF-8. Paths that are not valid UTF-8 have no key.
fn key_of(path: &Path) -> Option<&str> {
    let key = path.to_str();
    if key.is_none() {
        tracing::warn!("Skipping non UTF-8 path in hash store: {}", path.display());
    }
    key
}

fn last_index_key(collection: &str) -> String {
    format!("last_index_{}", collection)
}

fn decode(key: &str, bytes: &[u8]) -> StoreResult<FileHashEntry> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Encoding {
        key: key.to_string(),
        source,
    })
}

impl HashStore {
    /// Opens or creates the store, waiting up to [`DEFAULT_OPEN_TIMEOUT`]
    /// for another process to release it.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_with_timeout(path, DEFAULT_OPEN_TIMEOUT)
    }

    pub fn open_with_timeout<P: AsRef<Path>>(path: P, timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let started = Instant::now();

        let db = loop {
            match Database::create(&path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) if started.elapsed() < timeout => {
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(StoreError::Locked {
                        path,
                        waited: started.elapsed(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        };

        let txn = db.begin_write()?;
        {
            txn.open_table(FILE_HASHES)?;
            txn.open_table(METADATA)?;
        }
        txn.commit()?;

        tracing::debug!("Opened hash store at {}", path.display());
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_entry(&self, file_path: &Path) -> StoreResult<Option<FileHashEntry>> {
        let Some(key) = key_of(file_path) else {
            return Ok(None);
        };
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_HASHES)?;
        let entry = match table.get(key)? {
            Some(bytes) => Some(decode(key, bytes.value())?),
            None => None,
        };
        Ok(entry)
    }

    pub fn get_hash(&self, file_path: &Path) -> StoreResult<Option<String>> {
        Ok(self.get_entry(file_path)?.map(|entry| entry.hash))
    }

    pub fn set_hash(&self, file_path: &Path, hash: &str, modified: SystemTime, size: u64) -> StoreResult<()> {
        let Some(key) = key_of(file_path) else {
            return Ok(());
        };
        let entry = FileHashEntry {
            hash: hash.to_string(),
            last_modified: DateTime::<Utc>::from(modified),
            size,
        };
        let bytes = serde_json::to_vec(&entry).map_err(|source| StoreError::Encoding {
            key: key.to_string(),
            source,
        })?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(FILE_HASHES)?;
            table.insert(key, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn delete_hash(&self, file_path: &Path) -> StoreResult<()> {
        let Some(key) = key_of(file_path) else {
            return Ok(());
        };
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(FILE_HASHES)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Snapshot of every stored entry, read in one isolated transaction.
    /// Entries that fail to decode are logged and left out.
    pub fn get_all_entries(&self) -> StoreResult<HashMap<PathBuf, FileHashEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_HASHES)?;

        let mut entries = HashMap::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let key = key.value();
            match decode(key, value.value()) {
                Ok(entry) => {
                    entries.insert(PathBuf::from(key), entry);
                }
                Err(err) => tracing::warn!("Skipping stored entry: {}", err),
            }
        }
        Ok(entries)
    }

    pub fn get_all_hashes(&self) -> StoreResult<HashMap<PathBuf, String>> {
        Ok(self
            .get_all_entries()?
            .into_iter()
            .map(|(path, entry)| (path, entry.hash))
            .collect())
    }

    /// Diffs `current` against the stored hashes.
    pub fn get_changed_files(&self, current: &HashMap<PathBuf, String>) -> StoreResult<ChangeSet> {
        let stored = self.get_all_hashes()?;
        let mut changes = ChangeSet::default();

        for (path, hash) in current {
            match stored.get(path) {
                None => changes.created.push(path.clone()),
                Some(stored_hash) if stored_hash != hash => changes.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in stored.keys() {
            if !current.contains_key(path) {
                changes.deleted.push(path.clone());
            }
        }

        changes.created.sort();
        changes.modified.sort();
        changes.deleted.sort();
        Ok(changes)
    }

    pub fn set_last_index_time(&self, collection: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let key = last_index_key(collection);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(METADATA)?;
            table.insert(key.as_str(), at.timestamp_micros())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_last_index_time(&self, collection: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let key = last_index_key(collection);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA)?;
        let micros = table.get(key.as_str())?.map(|v| v.value());
        Ok(micros.and_then(DateTime::<Utc>::from_timestamp_micros))
    }

    pub fn len(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_HASHES)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}
