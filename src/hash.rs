//! Content fingerprints and the in-memory hash cache

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Computes the hex-encoded SHA-256 of a file's contents.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Path to content-hash map shared between the watcher's threads.
///
/// Every method takes the lock for a single map access; hashing happens
/// outside of it.
#[derive(Default)]
pub struct HashCache {
    hashes: Mutex<HashMap<PathBuf, String>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<String> {
        self.hashes.lock().get(path).cloned()
    }

    pub fn insert(&self, path: PathBuf, hash: String) {
        self.hashes.lock().insert(path, hash);
    }

    pub fn remove(&self, path: &Path) -> Option<String> {
        self.hashes.lock().remove(path)
    }

    /// Stores `hash` unless it equals the cached one. Returns whether the
    /// cache changed.
    pub fn update_if_changed(&self, path: &Path, hash: &str) -> bool {
        let mut hashes = self.hashes.lock();
        match hashes.get_mut(path) {
            Some(existing) if existing == hash => false,
            Some(existing) => {
                *existing = hash.to_string();
                true
            }
            None => {
                hashes.insert(path.to_path_buf(), hash.to_string());
                true
            }
        }
    }

    pub fn snapshot(&self) -> HashMap<PathBuf, String> {
        self.hashes.lock().clone()
    }

    pub fn replace_all(&self, hashes: HashMap<PathBuf, String>) {
        *self.hashes.lock() = hashes;
    }

    pub fn len(&self) -> usize {
        self.hashes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.lock().is_empty()
    }
}
