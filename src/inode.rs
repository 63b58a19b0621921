//! Platform-specific file identity

use std::fs::Metadata;

/// Identity of a file's storage object, stable across renames on one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    pub device: u64,
    pub inode: u64,
}

/// Extracts the inode and device from metadata.
///
/// Returns `None` where the platform has no inode semantics; callers then
/// treat creates and deletes as unrelated events.
#[cfg(unix)]
pub fn file_id(metadata: &Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    match metadata.ino() {
        0 => None,
        inode => Some(FileId {
            device: metadata.dev(),
            inode,
        }),
    }
}

#[cfg(not(unix))]
pub fn file_id(_metadata: &Metadata) -> Option<FileId> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_rename_preserves_file_id() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        let b = dir.path().join("b.go");
        fs::write(&a, "package a").unwrap();

        let before = file_id(&fs::metadata(&a).unwrap()).unwrap();
        fs::rename(&a, &b).unwrap();
        let after = file_id(&fs::metadata(&b).unwrap()).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_distinct_files_have_distinct_ids() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.go"), "a").unwrap();
        fs::write(dir.path().join("b.go"), "b").unwrap();

        let a = file_id(&fs::metadata(dir.path().join("a.go")).unwrap());
        let b = file_id(&fs::metadata(dir.path().join("b.go")).unwrap());

        assert_ne!(a, b);
    }
}
