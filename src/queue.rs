use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use parking_lot::Mutex;

use crate::events::{ChangeType, FileChange};

#[derive(Default)]
struct Pending {
    order: VecDeque<PathBuf>,
    changes: HashMap<PathBuf, FileChange>,
}

/// Pending changes keyed by path, drained in arrival order.
///
/// A path holds at most one entry; a newer change is folded into the
/// existing one and keeps its queue position.
#[derive(Default)]
pub struct ChangeQueue {
    pending: Mutex<Pending>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, change: FileChange) {
        let mut guard = self.pending.lock();
        Self::fold(&mut guard, change);
    }

    fn fold(pending: &mut Pending, change: FileChange) {
        if !pending.changes.contains_key(&change.path) {
            pending.order.push_back(change.path.clone());
            pending.changes.insert(change.path.clone(), change);
            return;
        }
        let existing = &pending.changes[&change.path];

        // Replacing a pending rename must not lose the path it came from
        let origin = match (existing.change_type, change.change_type) {
            (ChangeType::Rename, ChangeType::Delete | ChangeType::Rename) => existing
                .old_path
                .clone()
                .filter(|origin| change.old_path.as_ref() != Some(origin)),
            _ => None,
        };

        if change.change_type == ChangeType::Delete && origin.is_some() {
            // Never delivered under its new name, so only the origin goes away
            pending.changes.remove(&change.path);
            pending.order.retain(|queued| queued != &change.path);
        } else if let Some(existing) = pending.changes.get_mut(&change.path) {
            existing.absorb(change);
        }

        if let Some(origin) = origin {
            Self::fold(pending, FileChange::deleted(origin));
        }
    }

    /// Removes up to `max` changes, oldest first.
    pub fn drain(&self, max: usize) -> Vec<FileChange> {
        let mut pending = self.pending.lock();
        let take = max.min(pending.order.len());
        let mut batch = Vec::with_capacity(take);
        while batch.len() < take {
            let Some(path) = pending.order.pop_front() else {
                break;
            };
            if let Some(change) = pending.changes.remove(&path) {
                batch.push(change);
            }
        }
        batch
    }

    /// Withdraws the pending change for `path`, if any.
    pub fn remove(&self, path: &Path) -> Option<FileChange> {
        let mut guard = self.pending.lock();
        let pending = &mut *guard;
        let change = pending.changes.remove(path)?;
        pending.order.retain(|queued| queued != path);
        Some(change)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.pending.lock().changes.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<FileChange> {
        self.pending.lock().changes.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().order.is_empty()
    }
}

/// Deletions waiting out the rename window before they become final.
///
/// One deadline per path. Scheduling the same path again replaces the
/// deadline, and a rename that claims the path cancels it.
pub struct DeferredDeletes {
    deadlines: Mutex<HashMap<PathBuf, Instant>>,
    delay: Duration,
}

impl DeferredDeletes {
    pub fn new(delay: Duration) -> Self {
        Self {
            deadlines: Mutex::new(HashMap::new()),
            delay,
        }
    }

    pub fn schedule(&self, path: PathBuf) {
        self.schedule_at(path, Instant::now() + self.delay);
    }

    pub fn schedule_at(&self, path: PathBuf, deadline: Instant) {
        self.deadlines.lock().insert(path, deadline);
    }

    /// Returns whether a pending deletion was cancelled.
    pub fn cancel(&self, path: &Path) -> bool {
        self.deadlines.lock().remove(path).is_some()
    }

    /// Takes every deletion whose deadline has passed.
    pub fn take_due(&self, now: Instant) -> Vec<PathBuf> {
        let mut deadlines = self.deadlines.lock();
        let due: Vec<PathBuf> = deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            deadlines.remove(path);
        }
        due
    }

    /// Takes every pending deletion regardless of deadline.
    pub fn take_all(&self) -> Vec<PathBuf> {
        self.deadlines.lock().drain().map(|(path, _)| path).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.deadlines.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeType;

    fn modify(path: &str, hash: &str) -> FileChange {
        FileChange::modified(PathBuf::from(path), hash.to_string())
    }

    #[test]
    fn test_rapid_modifies_coalesce_to_last() {
        let queue = ChangeQueue::new();
        for hash in ["h1", "h2", "h3", "h4"] {
            queue.push(modify("/repo/a.go", hash));
        }

        let batch = queue.drain(100);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].change_type, ChangeType::Modify);
        assert_eq!(batch[0].content_hash.as_deref(), Some("h4"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_replacement_keeps_position() {
        let queue = ChangeQueue::new();
        queue.push(modify("/repo/a.go", "h1"));
        queue.push(modify("/repo/b.go", "h1"));
        queue.push(FileChange::deleted(PathBuf::from("/repo/a.go")));

        let batch = queue.drain(100);

        assert_eq!(batch[0].path, PathBuf::from("/repo/a.go"));
        assert_eq!(batch[0].change_type, ChangeType::Delete);
        assert_eq!(batch[1].path, PathBuf::from("/repo/b.go"));
    }

    #[test]
    fn test_drain_respects_batch_size() {
        let queue = ChangeQueue::new();
        for i in 0..5 {
            queue.push(modify(&format!("/repo/f{}.go", i), "h"));
        }

        let first = queue.drain(3);
        assert_eq!(first.len(), 3);
        assert_eq!(queue.len(), 2);

        let second = queue.drain(3);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].path, PathBuf::from("/repo/f3.go"));
        assert!(queue.drain(3).is_empty());
    }

    #[test]
    fn test_queue_lookup() {
        let queue = ChangeQueue::new();
        queue.push(FileChange::created(PathBuf::from("/repo/a.go"), None));

        assert!(queue.contains(Path::new("/repo/a.go")));
        assert_eq!(queue.get(Path::new("/repo/a.go")).unwrap().change_type, ChangeType::Create);
        assert!(!queue.contains(Path::new("/repo/b.go")));
    }

    #[test]
    fn test_delete_after_rename_deletes_origin() {
        let queue = ChangeQueue::new();
        queue.push(FileChange::renamed(PathBuf::from("/repo/a.go"), PathBuf::from("/repo/b.go")));
        queue.push(FileChange::deleted(PathBuf::from("/repo/b.go")));

        let batch = queue.drain(100);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].change_type, ChangeType::Delete);
        assert_eq!(batch[0].path, PathBuf::from("/repo/a.go"));
    }

    #[test]
    fn test_rename_over_pending_rename_deletes_first_origin() {
        let queue = ChangeQueue::new();
        queue.push(FileChange::renamed(PathBuf::from("/repo/a.go"), PathBuf::from("/repo/b.go")));
        queue.push(FileChange::renamed(PathBuf::from("/repo/x.go"), PathBuf::from("/repo/b.go")));

        let batch = queue.drain(100);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].change_type, ChangeType::Rename);
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/repo/x.go")));
        assert_eq!(batch[1].change_type, ChangeType::Delete);
        assert_eq!(batch[1].path, PathBuf::from("/repo/a.go"));
    }

    #[test]
    fn test_modify_after_rename_keeps_origin() {
        let queue = ChangeQueue::new();
        queue.push(FileChange::renamed(PathBuf::from("/repo/a.go"), PathBuf::from("/repo/b.go")));
        queue.push(modify("/repo/b.go", "h2"));

        let batch = queue.drain(100);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].change_type, ChangeType::Rename);
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/repo/a.go")));
    }

    #[test]
    fn test_remove_withdraws_change() {
        let queue = ChangeQueue::new();
        queue.push(modify("/repo/a.go", "h1"));
        queue.push(modify("/repo/b.go", "h1"));

        let removed = queue.remove(Path::new("/repo/a.go")).unwrap();

        assert_eq!(removed.path, PathBuf::from("/repo/a.go"));
        assert!(queue.remove(Path::new("/repo/a.go")).is_none());
        let batch = queue.drain(100);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, PathBuf::from("/repo/b.go"));
    }

    #[test]
    fn test_deferred_deletes_become_due() {
        let deletes = DeferredDeletes::new(Duration::from_millis(500));
        let now = Instant::now();
        deletes.schedule_at(PathBuf::from("/repo/a.go"), now + Duration::from_millis(100));
        deletes.schedule_at(PathBuf::from("/repo/b.go"), now + Duration::from_secs(10));

        assert!(deletes.take_due(now).is_empty());
        let due = deletes.take_due(now + Duration::from_millis(200));

        assert_eq!(due, vec![PathBuf::from("/repo/a.go")]);
        assert_eq!(deletes.pending_count(), 1);
    }

    #[test]
    fn test_cancelled_delete_never_fires() {
        let deletes = DeferredDeletes::new(Duration::from_millis(10));
        deletes.schedule(PathBuf::from("/repo/a.go"));

        assert!(deletes.cancel(Path::new("/repo/a.go")));
        assert!(!deletes.cancel(Path::new("/repo/a.go")));
        assert!(deletes.take_due(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_take_all_empties_schedule() {
        let deletes = DeferredDeletes::new(Duration::from_secs(60));
        deletes.schedule(PathBuf::from("/repo/a.go"));
        deletes.schedule(PathBuf::from("/repo/b.go"));

        assert_eq!(deletes.take_all().len(), 2);
        assert_eq!(deletes.pending_count(), 0);
    }
}
