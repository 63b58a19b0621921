//! Incremental change engine for one directory tree.
//!
//! Two threads cooperate: the ingestion thread classifies raw notify events
//! into pending [`FileChange`]s, and the flush thread hands queued changes to
//! the caller's handler every debounce interval, in batches.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;

use crate::config::WatcherOptions;
use crate::error::{WatchError, WatchResult};
use crate::events::{ChangeType, FileChange, RenameEvent};
use crate::filter::{is_code_file, FileFilter};
use crate::hash::{content_hash, HashCache};
use crate::queue::{ChangeQueue, DeferredDeletes};
use crate::rename::{DeleteInfo, RenameTracker, TrackerStats};
use crate::store::HashStore;

/// Receives each flushed batch. An error is logged; the batch still counts as
/// delivered and is not retried.
pub type ChangeHandler = Box<dyn Fn(Vec<FileChange>) -> anyhow::Result<()> + Send + Sync>;

enum WatchMessage {
    Fs(notify::Result<Event>),
    Shutdown,
}

/// Point-in-time counters for a watcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherStats {
    pub running: bool,
    pub watched_dirs: usize,
    pub tracked_hashes: usize,
    pub pending_changes: usize,
    pub pending_deletes: usize,
    pub batches_delivered: u64,
    pub changes_delivered: u64,
    pub tracker: TrackerStats,
}

struct WatchCore {
    root: PathBuf,
    debounce: Duration,
    batch_size: usize,
    filter: FileFilter,
    handler: ChangeHandler,
    hashes: HashCache,
    tracker: RenameTracker,
    queue: ChangeQueue,
    deletes: DeferredDeletes,
    store: Option<Arc<HashStore>>,
    fs_watcher: Mutex<Option<RecommendedWatcher>>,
    watched_dirs: Mutex<HashSet<PathBuf>>,
    batches_delivered: AtomicU64,
    changes_delivered: AtomicU64,
}

struct Runtime {
    event_tx: Sender<WatchMessage>,
    flush_stop_tx: Sender<()>,
    ingest: JoinHandle<()>,
    flush: JoinHandle<()>,
}

/// Watches a directory tree and delivers batched, classified changes.
pub struct Watcher {
    core: Arc<WatchCore>,
    runtime: Mutex<Option<Runtime>>,
}

impl Watcher {
    pub fn new<P, F>(root: P, options: WatcherOptions, handler: F) -> WatchResult<Self>
    where
        P: AsRef<Path>,
        F: Fn(Vec<FileChange>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::build(root.as_ref(), options, None, Box::new(handler))
    }

    /// Like [`Watcher::new`], persisting every delivered batch to `store`
    /// and reconciling against it on start.
    pub fn with_store<P, F>(
        root: P,
        options: WatcherOptions,
        store: Arc<HashStore>,
        handler: F,
    ) -> WatchResult<Self>
    where
        P: AsRef<Path>,
        F: Fn(Vec<FileChange>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::build(root.as_ref(), options, Some(store), Box::new(handler))
    }

    fn build(
        root: &Path,
        options: WatcherOptions,
        store: Option<Arc<HashStore>>,
        handler: ChangeHandler,
    ) -> WatchResult<Self> {
        if !root.is_dir() {
            return Err(WatchError::InvalidRoot(root.to_path_buf()));
        }
        let root = root
            .canonicalize()
            .map_err(|_| WatchError::InvalidRoot(root.to_path_buf()))?;

        let window = options.rename_window();
        let tracker = RenameTracker::new(window).map_err(|source| WatchError::Spawn {
            name: "rename-cleanup",
            source,
        })?;

        let core = WatchCore {
            filter: FileFilter::new(&root, &options.exclude_patterns),
            root,
            debounce: options.debounce_duration(),
            batch_size: options.batch_size.max(1),
            handler,
            hashes: HashCache::new(),
            tracker,
            queue: ChangeQueue::new(),
            deletes: DeferredDeletes::new(window),
            store,
            fs_watcher: Mutex::new(None),
            watched_dirs: Mutex::new(HashSet::new()),
            batches_delivered: AtomicU64::new(0),
            changes_delivered: AtomicU64::new(0),
        };

        Ok(Self {
            core: Arc::new(core),
            runtime: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.core.root
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Walks the tree, registers a watch per directory, records baseline
    /// hashes and inodes, then launches the ingestion and flush threads.
    ///
    /// With a store attached, differences between the walk and the stored
    /// hashes are queued first, offline renames included.
    pub fn start(&self) -> WatchResult<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(WatchError::AlreadyStarted);
        }

        let (event_tx, event_rx) = mpsc::channel::<WatchMessage>();
        let notify_tx = event_tx.clone();
        let fs_watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = notify_tx.send(WatchMessage::Fs(res));
        })?;
        *self.core.fs_watcher.lock() = Some(fs_watcher);

        let files = self.core.register_tree(&self.core.root, false);
        if let Some(store) = &self.core.store {
            if let Err(err) = self.core.reconcile(store) {
                self.core.fs_watcher.lock().take();
                return Err(err.into());
            }
        }

        let core = Arc::clone(&self.core);
        let ingest = thread::Builder::new()
            .name("watch-ingest".to_string())
            .spawn(move || {
                for message in event_rx {
                    match message {
                        WatchMessage::Fs(Ok(event)) => core.handle_event(event),
                        WatchMessage::Fs(Err(err)) => {
                            tracing::error!("File watcher error: {}", err);
                        }
                        WatchMessage::Shutdown => break,
                    }
                }
            })
            .map_err(|source| {
                self.core.fs_watcher.lock().take();
                WatchError::Spawn { name: "watch-ingest", source }
            })?;

        let (flush_stop_tx, flush_stop_rx) = mpsc::channel::<()>();
        let core = Arc::clone(&self.core);
        let flush = match thread::Builder::new()
            .name("watch-flush".to_string())
            .spawn(move || loop {
                match flush_stop_rx.recv_timeout(core.debounce) {
                    Err(RecvTimeoutError::Timeout) => core.flush(),
                    _ => break,
                }
            }) {
            Ok(flush) => flush,
            Err(source) => {
                let _ = event_tx.send(WatchMessage::Shutdown);
                let _ = ingest.join();
                self.core.fs_watcher.lock().take();
                return Err(WatchError::Spawn { name: "watch-flush", source });
            }
        };

        tracing::info!(
            "Watching {} ({} directories, {} files)",
            self.core.root.display(),
            self.core.watched_dirs.lock().len(),
            files
        );

        *runtime = Some(Runtime {
            event_tx,
            flush_stop_tx,
            ingest,
            flush,
        });
        Ok(())
    }

    /// Stops both threads, delivers everything still queued and releases the
    /// OS watches. Calling it on a stopped watcher does nothing.
    pub fn stop(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let _ = runtime.event_tx.send(WatchMessage::Shutdown);
        if runtime.ingest.join().is_err() {
            tracing::error!("Ingestion thread panicked");
        }
        let _ = runtime.flush_stop_tx.send(());
        if runtime.flush.join().is_err() {
            tracing::error!("Flush thread panicked");
        }

        self.core.flush_remaining();
        self.core.fs_watcher.lock().take();
        self.core.watched_dirs.lock().clear();
        tracing::info!("Stopped watching {}", self.core.root.display());
    }

    /// Delivers due changes now instead of waiting for the next tick.
    pub fn flush(&self) {
        self.core.flush();
    }

    /// Copy of the current path -> content hash map.
    pub fn file_hashes(&self) -> HashMap<PathBuf, String> {
        self.core.hashes.snapshot()
    }

    /// Replaces the hash map, e.g. with hashes persisted by a previous run.
    pub fn seed_hashes(&self, hashes: HashMap<PathBuf, String>) {
        self.core.hashes.replace_all(hashes);
    }

    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            running: self.is_running(),
            watched_dirs: self.core.watched_dirs.lock().len(),
            tracked_hashes: self.core.hashes.len(),
            pending_changes: self.core.queue.len(),
            pending_deletes: self.core.deletes.pending_count(),
            batches_delivered: self.core.batches_delivered.load(Ordering::Relaxed),
            changes_delivered: self.core.changes_delivered.load(Ordering::Relaxed),
            tracker: self.core.tracker.stats(),
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WatchCore {
    /// Registers watches for `dir` and everything below it. Files found are
    /// either recorded silently as baseline or classified as new arrivals.
    /// Returns the number of files found.
    fn register_tree(&self, dir: &Path, announce: bool) -> usize {
        // Watch before walking so files written mid-walk still raise events
        self.watch_dir(dir);
        let scan = self.filter.scan(dir);
        for sub in scan.dirs.iter().filter(|sub| sub.as_path() != dir) {
            self.watch_dir(sub);
        }
        for file in &scan.files {
            if announce {
                self.on_create_file(file);
            } else {
                self.record_baseline(file);
            }
        }
        scan.files.len()
    }

    fn watch_dir(&self, dir: &Path) {
        if let Some(fs_watcher) = self.fs_watcher.lock().as_mut() {
            if let Err(err) = fs_watcher.watch(dir, RecursiveMode::NonRecursive) {
                tracing::warn!("Failed to watch {}: {}", dir.display(), err);
                return;
            }
        }
        self.watched_dirs.lock().insert(dir.to_path_buf());
    }

    fn unwatch_under(&self, dir: &Path) {
        let gone: Vec<PathBuf> = {
            let mut watched = self.watched_dirs.lock();
            let gone: Vec<PathBuf> = watched.iter().filter(|d| d.starts_with(dir)).cloned().collect();
            for d in &gone {
                watched.remove(d);
            }
            gone
        };
        if let Some(fs_watcher) = self.fs_watcher.lock().as_mut() {
            for d in &gone {
                // The kernel usually drops the watch with the directory
                if let Err(err) = fs_watcher.unwatch(d) {
                    tracing::debug!("Unwatch {}: {}", d.display(), err);
                }
            }
        }
    }

    fn record_baseline(&self, path: &Path) {
        match content_hash(path) {
            Ok(hash) => self.hashes.insert(path.to_path_buf(), hash),
            Err(err) => tracing::debug!("Failed to hash {}: {}", path.display(), err),
        }
        if let Err(err) = self.tracker.track_file(path) {
            tracing::debug!("Failed to track inode of {}: {}", path.display(), err);
        }
    }

    fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.on_appear(path);
                }
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    self.on_disappear(path);
                }
            }
            // Both halves arrive on their own as well
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {}
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if path.exists() {
                        self.on_appear(path);
                    } else {
                        self.on_disappear(path);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.on_write(path);
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }

    fn on_appear(&self, path: &Path) {
        if self.filter.is_excluded(path) {
            return;
        }
        let Ok(metadata) = fs::metadata(path) else {
            return;
        };

        if metadata.is_dir() {
            let found = self.register_tree(path, true);
            tracing::debug!("New directory {} ({} files)", path.display(), found);
        } else if metadata.is_file() && is_code_file(path) {
            self.on_create_file(path);
        }
    }

    fn on_create_file(&self, path: &Path) {
        if let Some(rename) = self.tracker.handle_create(path) {
            self.apply_rename(rename);
            return;
        }

        // Replaced in place, e.g. an editor's atomic save
        if self.hashes.get(path).is_some() {
            self.on_write(path);
            return;
        }

        let hash = match content_hash(path) {
            Ok(hash) => {
                self.hashes.insert(path.to_path_buf(), hash.clone());
                Some(hash)
            }
            Err(err) => {
                tracing::debug!("Failed to hash {}: {}", path.display(), err);
                None
            }
        };
        tracing::debug!("File created: {}", path.display());
        self.queue.push(FileChange::created(path.to_path_buf(), hash));
    }

    fn apply_rename(&self, rename: RenameEvent) {
        let RenameEvent { old_path, new_path, .. } = rename;
        self.deletes.cancel(&old_path);
        self.hashes.remove(&old_path);

        let hash = match content_hash(&new_path) {
            Ok(hash) => {
                self.hashes.insert(new_path.clone(), hash.clone());
                Some(hash)
            }
            Err(err) => {
                tracing::debug!("Failed to hash {}: {}", new_path.display(), err);
                None
            }
        };

        // The handler only ever saw where the file was before any pending move
        let pending = self.queue.remove(&old_path);
        let origin = match &pending {
            Some(p) if p.change_type == ChangeType::Rename => p.old_path.clone(),
            _ => None,
        }
        .unwrap_or_else(|| old_path.clone());

        let change = match pending.map(|p| p.change_type) {
            // A file nobody has been told about yet just moves its create along
            Some(ChangeType::Create) => FileChange::created(new_path.clone(), hash),
            // Moved back to where it started
            _ if origin == new_path => match hash {
                Some(hash) => FileChange::modified(new_path.clone(), hash),
                None => return,
            },
            _ => {
                let change = FileChange::renamed(origin, new_path.clone());
                match hash {
                    Some(hash) => change.with_hash(hash),
                    None => change,
                }
            }
        };

        tracing::debug!("File renamed: {} -> {}", old_path.display(), new_path.display());
        self.queue.push(change);
    }

    fn on_write(&self, path: &Path) {
        if !self.filter.should_track(path) {
            return;
        }
        let hash = match content_hash(path) {
            Ok(hash) => hash,
            Err(err) => {
                tracing::debug!("Failed to hash {}: {}", path.display(), err);
                return;
            }
        };

        if self.hashes.update_if_changed(path, &hash) {
            tracing::debug!("File modified: {}", path.display());
            self.queue.push(FileChange::modified(path.to_path_buf(), hash));
        }
    }

    fn on_disappear(&self, path: &Path) {
        if self.filter.is_excluded(path) {
            return;
        }

        if is_code_file(path) {
            self.remove_file(path);
            return;
        }

        // Probably a directory; its files went with it
        let children = self.tracker.tracked_under(path);
        if !children.is_empty() {
            tracing::debug!("Directory removed: {} ({} files)", path.display(), children.len());
        }
        for child in &children {
            self.remove_file(child);
        }
        self.unwatch_under(path);
    }

    fn remove_file(&self, path: &Path) {
        let known = self.hashes.remove(path).is_some();
        match self.tracker.handle_delete(path) {
            Some(_) => {
                tracing::debug!("File removed, awaiting rename: {}", path.display());
                self.deletes.schedule(path.to_path_buf());
            }
            None if known => {
                tracing::debug!("File deleted: {}", path.display());
                self.queue.push(FileChange::deleted(path.to_path_buf()));
            }
            None => {}
        }
    }

    /// Turns deletions whose rename window has passed into changes.
    fn finalize_deletes(&self, due: Vec<PathBuf>) {
        for path in due {
            // Something new already lives there and was reported as such
            if path.exists() {
                continue;
            }
            tracing::debug!("File deleted: {}", path.display());
            self.queue.push(FileChange::deleted(path));
        }
    }

    fn flush(&self) {
        self.finalize_deletes(self.deletes.take_due(Instant::now()));
        let batch = self.queue.drain(self.batch_size);
        self.deliver(batch);
    }

    fn flush_remaining(&self) {
        self.finalize_deletes(self.deletes.take_all());
        loop {
            let batch = self.queue.drain(self.batch_size);
            if batch.is_empty() {
                break;
            }
            self.deliver(batch);
        }
    }

    fn deliver(&self, batch: Vec<FileChange>) {
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let persisted = self.store.as_ref().map(|_| batch.clone());
        let result = (self.handler)(batch);
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
        self.changes_delivered.fetch_add(count as u64, Ordering::Relaxed);

        match result {
            Ok(()) => tracing::info!("Processed batch of {} changes", count),
            Err(err) => tracing::error!("Change handler failed on {} changes: {:#}", count, err),
        }

        // Delivered either way; a failed batch is not retried, even after a restart
        if let (Some(store), Some(batch)) = (&self.store, persisted) {
            persist(store, &batch);
        }
    }

    /// Queues the difference between the walked tree and the stored hashes.
    fn reconcile(&self, store: &HashStore) -> crate::error::StoreResult<()> {
        let current = self.hashes.snapshot();
        let changes = store.get_changed_files(&current)?;
        if changes.is_empty() {
            tracing::info!("Hash store is up to date ({} files)", current.len());
            return Ok(());
        }

        let entries = store.get_all_entries()?;
        let deletes: Vec<DeleteInfo> = changes
            .deleted
            .iter()
            .filter_map(|path| {
                entries.get(path).map(|entry| {
                    DeleteInfo::from_snapshot(path.clone(), entry.size, SystemTime::from(entry.last_modified))
                })
            })
            .collect();

        let renames = self.tracker.detect_bulk_renames(&deletes, &changes.created);
        let moved_from: HashSet<&Path> = renames.iter().map(|r| r.old_path.as_path()).collect();
        let moved_to: HashSet<&Path> = renames.iter().map(|r| r.new_path.as_path()).collect();

        for rename in &renames {
            let mut change = FileChange::renamed(rename.old_path.clone(), rename.new_path.clone());
            if let Some(hash) = current.get(&rename.new_path) {
                change = change.with_hash(hash.clone());
            }
            self.queue.push(change);
        }
        for path in changes.created.iter().filter(|p| !moved_to.contains(p.as_path())) {
            self.queue
                .push(FileChange::created(path.clone(), current.get(path).cloned()));
        }
        for path in &changes.modified {
            if let Some(hash) = current.get(path) {
                self.queue.push(FileChange::modified(path.clone(), hash.clone()));
            }
        }
        for path in changes.deleted.iter().filter(|p| !moved_from.contains(p.as_path())) {
            self.queue.push(FileChange::deleted(path.clone()));
        }

        tracing::info!(
            "Offline changes: {} created, {} modified, {} deleted, {} renamed",
            changes.created.len() - moved_to.len(),
            changes.modified.len(),
            changes.deleted.len() - moved_from.len(),
            renames.len()
        );
        Ok(())
    }
}

/// Mirrors a delivered batch into the store. Failures are logged only.
fn persist(store: &HashStore, batch: &[FileChange]) {
    for change in batch {
        let result = match change.change_type {
            ChangeType::Delete => store.delete_hash(&change.path),
            ChangeType::Rename => {
                let moved = match change.old_path() {
                    Some(old) => store.delete_hash(old),
                    None => Ok(()),
                };
                moved.and_then(|()| record(store, change))
            }
            ChangeType::Create | ChangeType::Modify => record(store, change),
        };
        if let Err(err) = result {
            tracing::warn!("Failed to persist hash for {}: {}", change.path.display(), err);
        }
    }
}

fn record(store: &HashStore, change: &FileChange) -> crate::error::StoreResult<()> {
    let Some(hash) = change.content_hash.as_deref() else {
        return Ok(());
    };
    let Ok(metadata) = fs::metadata(&change.path) else {
        return Ok(());
    };
    let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
    store.set_hash(&change.path, hash, modified, metadata.len())
}
