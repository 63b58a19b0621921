//! Inode-based rename correlation
//!
//! Filesystem notifications report a rename as an unrelated delete and
//! create, sometimes out of order and sometimes with one half missing. The
//! tracker remembers which inode lives at which path so the two halves can be
//! joined back into one rename.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use parking_lot::RwLock;

use crate::events::RenameEvent;
use crate::inode::{file_id, FileId};

pub const DEFAULT_RENAME_WINDOW: Duration = Duration::from_millis(500);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// A deletion held back in case the matching create shows up.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteInfo {
    pub path: PathBuf,
    /// `None` when rebuilt from a snapshot instead of observed
    pub file_id: Option<FileId>,
    pub deleted_at: Instant,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl DeleteInfo {
    /// Rebuilds a deletion from recorded metadata, e.g. a persisted hash entry.
    pub fn from_snapshot(path: PathBuf, size: u64, modified: SystemTime) -> Self {
        Self {
            path,
            file_id: None,
            deleted_at: Instant::now(),
            size,
            modified: Some(modified),
        }
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.modified.map(|modified| Fingerprint::new(self.size, modified))
    }
}

/// `(size, mtime-second)` pair used to pair files without inode information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime_secs: i64,
}

impl Fingerprint {
    pub fn new(size: u64, modified: SystemTime) -> Self {
        let mtime_secs = match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64) - 1,
        };
        Self { size, mtime_secs }
    }

    pub fn of(metadata: &fs::Metadata) -> Option<Self> {
        metadata.modified().ok().map(|m| Self::new(metadata.len(), m))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerStats {
    pub tracked_files: usize,
    pub tracked_inodes: usize,
    pub recent_deletes: usize,
}

#[derive(Debug, Clone, Copy)]
struct TrackedFile {
    id: FileId,
    size: u64,
    modified: Option<SystemTime>,
}

impl TrackedFile {
    fn from_metadata(id: FileId, metadata: &fs::Metadata) -> Self {
        Self {
            id,
            size: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

#[derive(Default)]
struct Tables {
    inode_to_path: HashMap<FileId, PathBuf>,
    path_to_inode: HashMap<PathBuf, TrackedFile>,
    recent_deletes: HashMap<FileId, DeleteInfo>,
}

impl Tables {
    /// Points `path` and `tracked.id` at each other, dropping whatever either
    /// side pointed at before.
    fn link(&mut self, path: &Path, tracked: TrackedFile) {
        if let Some(old_path) = self.inode_to_path.get(&tracked.id) {
            if old_path != path {
                let old_path = old_path.clone();
                if self.path_to_inode.get(&old_path).map(|t| t.id) == Some(tracked.id) {
                    self.path_to_inode.remove(&old_path);
                }
            }
        }
        if let Some(previous) = self.path_to_inode.get(path) {
            if previous.id != tracked.id
                && self.inode_to_path.get(&previous.id).map(PathBuf::as_path) == Some(path)
            {
                let stale = previous.id;
                self.inode_to_path.remove(&stale);
            }
        }
        self.inode_to_path.insert(tracked.id, path.to_path_buf());
        self.path_to_inode.insert(path.to_path_buf(), tracked);
    }
}

struct Shared {
    tables: RwLock<Tables>,
    window: Duration,
}

impl Shared {
    fn purge_expired(&self, now: Instant) -> usize {
        let ttl = self.window * 2;
        let mut tables = self.tables.write();
        let expired: Vec<FileId> = tables
            .recent_deletes
            .iter()
            .filter(|(_, info)| now.saturating_duration_since(info.deleted_at) > ttl)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(info) = tables.recent_deletes.remove(id) {
                if tables.inode_to_path.get(id) == Some(&info.path) {
                    tables.inode_to_path.remove(id);
                }
            }
        }
        expired.len()
    }
}

struct Cleanup {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Tracks inode <-> path identity for live files and recently deleted ones.
///
/// Owns a cleanup thread that expires unmatched deletions; the thread is
/// stopped and joined when the tracker is dropped.
pub struct RenameTracker {
    shared: Arc<Shared>,
    cleanup: Option<Cleanup>,
}

impl RenameTracker {
    pub fn new(window: Duration) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            tables: RwLock::new(Tables::default()),
            window,
        });

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("rename-cleanup".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(CLEANUP_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {
                        let purged = worker.purge_expired(Instant::now());
                        if purged > 0 {
                            tracing::debug!("Expired {} unmatched deletions", purged);
                        }
                    }
                    _ => break,
                }
            })?;

        Ok(Self {
            shared,
            cleanup: Some(Cleanup { stop_tx, thread }),
        })
    }

    pub fn window(&self) -> Duration {
        self.shared.window
    }

    /// Records the inode of an existing file.
    pub fn track_file(&self, path: &Path) -> io::Result<FileId> {
        let metadata = fs::metadata(path)?;
        let id = file_id(&metadata).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no inode available for {}", path.display()),
            )
        })?;

        self.shared
            .tables
            .write()
            .link(path, TrackedFile::from_metadata(id, &metadata));
        Ok(id)
    }

    /// Records a deletion that may turn out to be the first half of a rename.
    ///
    /// The backward inode -> path mapping is kept until the deletion is
    /// claimed or expires.
    pub fn handle_delete(&self, path: &Path) -> Option<DeleteInfo> {
        let on_disk = fs::metadata(path).ok();

        let mut tables = self.shared.tables.write();
        let tracked = tables.path_to_inode.get(path).copied();

        let id = match tracked {
            Some(t) => t.id,
            None => on_disk.as_ref().and_then(file_id)?,
        };

        let (size, modified) = match (&on_disk, tracked) {
            (Some(metadata), _) => (metadata.len(), metadata.modified().ok()),
            (None, Some(t)) => (t.size, t.modified),
            (None, None) => (0, None),
        };

        let info = DeleteInfo {
            path: path.to_path_buf(),
            file_id: Some(id),
            deleted_at: Instant::now(),
            size,
            modified,
        };

        tables.recent_deletes.insert(id, info.clone());
        tables.path_to_inode.remove(path);

        Some(info)
    }

    /// Classifies a newly appeared file as a rename or a new file.
    pub fn handle_create(&self, path: &Path) -> Option<RenameEvent> {
        let metadata = fs::metadata(path).ok()?;
        let id = file_id(&metadata)?;
        let tracked = TrackedFile::from_metadata(id, &metadata);

        let mut tables = self.shared.tables.write();

        if let Some(info) = tables.recent_deletes.get(&id) {
            if info.deleted_at.elapsed() <= self.shared.window {
                let old_path = info.path.clone();
                tables.recent_deletes.remove(&id);
                tables.link(path, tracked);
                return Some(RenameEvent {
                    old_path,
                    new_path: path.to_path_buf(),
                    file_id: Some(id),
                });
            }
        }

        // Only a live path can be the source of a move
        let moved_from = tables
            .inode_to_path
            .get(&id)
            .filter(|previous| previous.as_path() != path)
            .filter(|previous| tables.path_to_inode.get(*previous).map(|t| t.id) == Some(id))
            .cloned();
        if let Some(old_path) = moved_from {
            tables.link(path, tracked);
            return Some(RenameEvent {
                old_path,
                new_path: path.to_path_buf(),
                file_id: Some(id),
            });
        }

        tables.link(path, tracked);
        None
    }

    /// Pairs deletions with creations by `(size, mtime-second)`.
    ///
    /// Used to reconcile two snapshots where no inode history exists. Each
    /// create claims the first remaining delete with the same fingerprint, in
    /// the order both lists were given. When several files share a
    /// fingerprint the pairing is a guess.
    pub fn detect_bulk_renames(&self, deletes: &[DeleteInfo], creates: &[PathBuf]) -> Vec<RenameEvent> {
        let mut by_fingerprint: HashMap<Fingerprint, Vec<&DeleteInfo>> = HashMap::new();
        for info in deletes {
            if let Some(fp) = info.fingerprint() {
                by_fingerprint.entry(fp).or_default().push(info);
            }
        }
        for candidates in by_fingerprint.values_mut() {
            candidates.reverse();
        }

        let mut renames = Vec::new();
        for create in creates {
            let Ok(metadata) = fs::metadata(create) else {
                continue;
            };
            let Some(fp) = Fingerprint::of(&metadata) else {
                continue;
            };
            let Some(info) = by_fingerprint.get_mut(&fp).and_then(|c| c.pop()) else {
                continue;
            };

            let id = file_id(&metadata);
            {
                let mut tables = self.shared.tables.write();
                if let Some(old_id) = info.file_id {
                    tables.recent_deletes.remove(&old_id);
                }
                tables.path_to_inode.remove(&info.path);
                if let Some(id) = id {
                    tables.link(create, TrackedFile::from_metadata(id, &metadata));
                }
            }

            renames.push(RenameEvent {
                old_path: info.path.clone(),
                new_path: create.clone(),
                file_id: id,
            });
        }

        renames
    }

    /// Drops deletions older than twice the window. Runs on the cleanup
    /// thread every [`CLEANUP_INTERVAL`].
    pub fn purge_expired(&self) -> usize {
        self.shared.purge_expired(Instant::now())
    }

    pub fn inode_of(&self, path: &Path) -> Option<FileId> {
        if let Some(t) = self.shared.tables.read().path_to_inode.get(path) {
            return Some(t.id);
        }
        fs::metadata(path).ok().as_ref().and_then(file_id)
    }

    pub fn path_of(&self, id: FileId) -> Option<PathBuf> {
        self.shared.tables.read().inode_to_path.get(&id).cloned()
    }

    pub fn is_pending_delete(&self, path: &Path) -> bool {
        self.shared
            .tables
            .read()
            .recent_deletes
            .values()
            .any(|info| info.path == path)
    }

    /// Live tracked paths under `dir`.
    pub fn tracked_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.shared
            .tables
            .read()
            .path_to_inode
            .keys()
            .filter(|p| p.starts_with(dir) && p.as_path() != dir)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> TrackerStats {
        let tables = self.shared.tables.read();
        TrackerStats {
            tracked_files: tables.path_to_inode.len(),
            tracked_inodes: tables.inode_to_path.len(),
            recent_deletes: tables.recent_deletes.len(),
        }
    }

    pub fn clear(&self) {
        *self.shared.tables.write() = Tables::default();
    }
}

impl Drop for RenameTracker {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            let _ = cleanup.stop_tx.send(());
            let _ = cleanup.thread.join();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker(window_ms: u64) -> RenameTracker {
        RenameTracker::new(Duration::from_millis(window_ms)).unwrap()
    }

    #[test]
    fn test_track_file_records_both_directions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.go");
        fs::write(&path, "package a").unwrap();

        let t = tracker(500);
        let id = t.track_file(&path).unwrap();

        assert_eq!(t.inode_of(&path), Some(id));
        assert_eq!(t.path_of(id), Some(path));
        assert_eq!(t.stats().tracked_files, 1);
    }

    #[test]
    fn test_track_file_current_path_wins() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        let b = dir.path().join("b.go");
        fs::write(&a, "package a").unwrap();

        let t = tracker(500);
        let id = t.track_file(&a).unwrap();
        fs::rename(&a, &b).unwrap();
        t.track_file(&b).unwrap();

        assert_eq!(t.path_of(id), Some(b.clone()));
        let stats = t.stats();
        assert_eq!(stats.tracked_files, 1);
        assert_eq!(stats.tracked_inodes, 1);
    }

    #[test]
    fn test_track_missing_file_fails() {
        let t = tracker(500);
        assert!(t.track_file(Path::new("/nonexistent/a.go")).is_err());
    }

    #[test]
    fn test_delete_then_create_is_rename() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        let b = dir.path().join("b.go");
        fs::write(&a, "package a").unwrap();

        let t = tracker(500);
        let id = t.track_file(&a).unwrap();
        fs::rename(&a, &b).unwrap();

        let info = t.handle_delete(&a).expect("tracked file resolves its inode");
        assert_eq!(info.file_id, Some(id));
        assert_eq!(info.size, "package a".len() as u64);
        // backward mapping survives the delete
        assert_eq!(t.path_of(id), Some(a.clone()));

        let rename = t.handle_create(&b).expect("same inode within window");
        assert_eq!(rename.old_path, a);
        assert_eq!(rename.new_path, b);
        assert_eq!(rename.file_id, Some(id));
        assert_eq!(t.stats().recent_deletes, 0);
        assert_eq!(t.path_of(id), Some(b));
    }

    #[test]
    fn test_create_after_window_is_new_file() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        let b = dir.path().join("b.go");
        fs::write(&a, "package a").unwrap();

        let t = tracker(20);
        t.track_file(&a).unwrap();
        fs::rename(&a, &b).unwrap();
        t.handle_delete(&a).unwrap();
        thread::sleep(Duration::from_millis(30));

        // the backward mapping has not been purged, but a.go is no longer live
        assert_eq!(t.path_of(t.inode_of(&b).unwrap()), Some(a.clone()));
        assert!(t.handle_create(&b).is_none());
        assert_eq!(t.path_of(t.inode_of(&b).unwrap()), Some(b.clone()));
        // the stale deletion is left for the cleanup loop
        assert_eq!(t.stats().recent_deletes, 1);
    }

    #[test]
    fn test_missed_delete_still_detects_move() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        let b = dir.path().join("b.go");
        fs::write(&a, "package a").unwrap();

        let t = tracker(500);
        t.track_file(&a).unwrap();
        fs::rename(&a, &b).unwrap();

        let rename = t.handle_create(&b).expect("inode already mapped elsewhere");
        assert_eq!(rename.old_path, a);
        assert_eq!(t.inode_of(&b), rename.file_id);
        assert_eq!(t.stats().tracked_files, 1);
    }

    #[test]
    fn test_unrelated_create_is_new_file() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        let c = dir.path().join("c.go");
        fs::write(&a, "package a").unwrap();

        let t = tracker(500);
        t.track_file(&a).unwrap();
        fs::write(&c, "package c").unwrap();

        assert!(t.handle_create(&c).is_none());
        assert!(t.inode_of(&c).is_some());
        assert_eq!(t.stats().tracked_files, 2);
    }

    #[test]
    fn test_delete_of_unknown_path_returns_none() {
        let t = tracker(500);
        assert!(t.handle_delete(Path::new("/nonexistent/a.go")).is_none());
        assert_eq!(t.stats().recent_deletes, 0);
    }

    #[test]
    fn test_purge_expired_drops_delete_and_backward_mapping() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        fs::write(&a, "package a").unwrap();

        let t = tracker(10);
        let id = t.track_file(&a).unwrap();
        fs::remove_file(&a).unwrap();
        t.handle_delete(&a).unwrap();

        assert_eq!(t.purge_expired(), 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(t.purge_expired(), 1);

        assert_eq!(t.path_of(id), None);
        assert_eq!(t.stats(), TrackerStats::default());
        assert!(!t.is_pending_delete(&a));
    }

    #[test]
    fn test_cleanup_thread_expires_deletes() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        fs::write(&a, "package a").unwrap();

        let t = tracker(10);
        t.track_file(&a).unwrap();
        fs::remove_file(&a).unwrap();
        t.handle_delete(&a).unwrap();
        assert!(t.is_pending_delete(&a));

        thread::sleep(CLEANUP_INTERVAL + Duration::from_millis(500));
        assert!(!t.is_pending_delete(&a));
    }

    #[test]
    fn test_bulk_renames_pair_in_discovery_order() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let content = vec![b'x'; 500];
        for name in ["a.go", "b.go"] {
            fs::write(root.join(name), &content).unwrap();
        }

        // same size and mtime second for all four files
        let mtime = fs::metadata(root.join("a.go")).unwrap().modified().unwrap();
        let b_file = fs::File::options().write(true).open(root.join("b.go")).unwrap();
        b_file.set_modified(mtime).unwrap();
        drop(b_file);

        let t = tracker(500);
        t.track_file(&root.join("a.go")).unwrap();
        t.track_file(&root.join("b.go")).unwrap();

        let deletes: Vec<DeleteInfo> = ["a.go", "b.go"]
            .iter()
            .map(|name| {
                let path = root.join(name);
                fs::remove_file(&path).unwrap();
                t.handle_delete(&path).unwrap()
            })
            .collect();

        for name in ["c.go", "d.go"] {
            let path = root.join(name);
            fs::write(&path, &content).unwrap();
            let f = fs::File::options().write(true).open(&path).unwrap();
            f.set_modified(mtime).unwrap();
        }

        let renames = t.detect_bulk_renames(&deletes, &[root.join("c.go"), root.join("d.go")]);

        assert_eq!(renames.len(), 2);
        assert_eq!(renames[0].old_path, root.join("a.go"));
        assert_eq!(renames[0].new_path, root.join("c.go"));
        assert_eq!(renames[1].old_path, root.join("b.go"));
        assert_eq!(renames[1].new_path, root.join("d.go"));
        assert_eq!(t.stats().recent_deletes, 0);
    }

    #[test]
    fn test_bulk_renames_skip_mismatched_fingerprints() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let created = root.join("c.go");
        fs::write(&created, "short").unwrap();

        let t = tracker(500);
        let deleted = DeleteInfo::from_snapshot(root.join("a.go"), 9_999, SystemTime::now());

        assert!(t.detect_bulk_renames(&[deleted], &[created]).is_empty());
    }

    #[test]
    fn test_fingerprint_uses_whole_seconds() {
        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = Fingerprint::new(10, base + Duration::from_millis(100));
        let b = Fingerprint::new(10, base + Duration::from_millis(900));

        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::new(11, base));
    }

    #[test]
    fn test_tracked_under_directory() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("pkg");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("a.go"), "a").unwrap();
        fs::write(dir.path().join("b.go"), "b").unwrap();

        let t = tracker(500);
        t.track_file(&pkg.join("a.go")).unwrap();
        t.track_file(&dir.path().join("b.go")).unwrap();

        assert_eq!(t.tracked_under(&pkg), vec![pkg.join("a.go")]);
    }

    #[test]
    fn test_clear_resets_tables() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.go");
        fs::write(&a, "a").unwrap();

        let t = tracker(500);
        t.track_file(&a).unwrap();
        t.clear();

        assert_eq!(t.stats(), TrackerStats::default());
    }
}
