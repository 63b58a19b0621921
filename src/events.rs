use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
    Rename,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "CREATED",
            ChangeType::Modify => "MODIFIED",
            ChangeType::Delete => "DELETED",
            ChangeType::Rename => "RENAMED",
        }
    }

    pub fn short(&self) -> char {
        match self {
            ChangeType::Create => 'C',
            ChangeType::Modify => 'M',
            ChangeType::Delete => 'D',
            ChangeType::Rename => 'R',
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified change to one code file, as delivered to the batch handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub change_type: ChangeType,
    /// Previous location, only set for renames
    pub old_path: Option<PathBuf>,
    /// Hex SHA-256 of the content, set for creates and modifies
    pub content_hash: Option<String>,
    pub timestamp: SystemTime,
}

impl FileChange {
    pub fn new(path: PathBuf, change_type: ChangeType) -> Self {
        Self {
            path,
            change_type,
            old_path: None,
            content_hash: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn created(path: PathBuf, hash: Option<String>) -> Self {
        Self::new(path, ChangeType::Create).with_hash_opt(hash)
    }

    pub fn modified(path: PathBuf, hash: String) -> Self {
        Self::new(path, ChangeType::Modify).with_hash(hash)
    }

    pub fn deleted(path: PathBuf) -> Self {
        Self::new(path, ChangeType::Delete)
    }

    pub fn renamed(old_path: PathBuf, new_path: PathBuf) -> Self {
        let mut change = Self::new(new_path, ChangeType::Rename);
        change.old_path = Some(old_path);
        change
    }

    pub fn with_hash(mut self, hash: String) -> Self {
        self.content_hash = Some(hash);
        self
    }

    fn with_hash_opt(mut self, hash: Option<String>) -> Self {
        self.content_hash = hash;
        self
    }

    pub fn old_path(&self) -> Option<&Path> {
        self.old_path.as_deref()
    }

    /// Folds a newer change for the same path into this pending one.
    ///
    /// The newer change wins, except that a modify landing on a pending
    /// create or rename keeps the pending type and only refreshes the hash.
    pub fn absorb(&mut self, newer: FileChange) {
        debug_assert_eq!(self.path, newer.path);
        match (self.change_type, newer.change_type) {
            (ChangeType::Create | ChangeType::Rename, ChangeType::Modify) => {
                self.content_hash = newer.content_hash;
                self.timestamp = newer.timestamp;
            }
            _ => *self = newer,
        }
    }
}

/// A rename recovered from inode identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameEvent {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    /// `None` when paired by fingerprint on a platform without inodes
    pub file_id: Option<crate::inode::FileId>,
}

impl From<RenameEvent> for FileChange {
    fn from(event: RenameEvent) -> Self {
        FileChange::renamed(event.old_path, event.new_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::FileId;

    #[test]
    fn test_file_change_creation() {
        let path = PathBuf::from("src/main.rs");
        let change = FileChange::new(path.clone(), ChangeType::Modify);

        assert_eq!(change.path, path);
        assert_eq!(change.change_type, ChangeType::Modify);
        assert!(change.old_path.is_none());
        assert!(change.content_hash.is_none());
    }

    #[test]
    fn test_renamed_sets_old_path() {
        let change = FileChange::renamed(PathBuf::from("a.go"), PathBuf::from("b.go"));

        assert_eq!(change.path, PathBuf::from("b.go"));
        assert_eq!(change.old_path(), Some(Path::new("a.go")));
        assert_eq!(change.change_type, ChangeType::Rename);
    }

    #[test]
    fn test_newer_change_replaces_older() {
        let mut pending = FileChange::modified(PathBuf::from("a.go"), "h1".to_string());
        pending.absorb(FileChange::deleted(PathBuf::from("a.go")));

        assert_eq!(pending.change_type, ChangeType::Delete);
        assert!(pending.content_hash.is_none());
    }

    #[test]
    fn test_modify_after_create_stays_create() {
        let mut pending = FileChange::created(PathBuf::from("a.go"), Some("empty".to_string()));
        pending.absorb(FileChange::modified(PathBuf::from("a.go"), "full".to_string()));

        assert_eq!(pending.change_type, ChangeType::Create);
        assert_eq!(pending.content_hash.as_deref(), Some("full"));
    }

    #[test]
    fn test_modify_after_rename_keeps_origin() {
        let mut pending = FileChange::renamed(PathBuf::from("a.go"), PathBuf::from("b.go"));
        pending.absorb(FileChange::modified(PathBuf::from("b.go"), "h2".to_string()));

        assert_eq!(pending.change_type, ChangeType::Rename);
        assert_eq!(pending.old_path(), Some(Path::new("a.go")));
        assert_eq!(pending.content_hash.as_deref(), Some("h2"));
    }

    #[test]
    fn test_rename_event_into_change() {
        let event = RenameEvent {
            old_path: PathBuf::from("old.rs"),
            new_path: PathBuf::from("new.rs"),
            file_id: Some(FileId { device: 1, inode: 42 }),
        };
        let change: FileChange = event.into();

        assert_eq!(change.change_type, ChangeType::Rename);
        assert_eq!(change.path, PathBuf::from("new.rs"));
        assert_eq!(change.old_path, Some(PathBuf::from("old.rs")));
    }

    #[test]
    fn test_change_type_labels() {
        assert_eq!(ChangeType::Create.to_string(), "CREATED");
        assert_eq!(ChangeType::Rename.short(), 'R');
    }
}
