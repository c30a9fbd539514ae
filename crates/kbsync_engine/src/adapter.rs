//! The storage adapter contract.

use crate::error::SyncResult;
use kbsync_protocol::{
    now_millis, ChangePage, ChangeRecord, Item, Lock, LockStatus, PutOutcome, RemoteMeta,
    SyncCursor, SyncStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::warn;

/// Capabilities every remote backend provides.
///
/// Rules binding on every implementation:
///
/// - Reads are idempotent and never mutate remote state.
/// - Failures come back as sentinels (`false`, `None`, empty), never as
///   errors or panics. The engine decides what is fatal.
/// - [`list_changes`](Self::list_changes) can resume from any cursor it
///   returned earlier, and its ordering never changes between calls.
///
/// `get_*` methods return `Some(default)`-style values for documents that
/// simply do not exist yet and `None` when the backend could not be read.
pub trait StorageAdapter: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Checks reachability and prepares the remote layout if needed.
    fn test_connection(&self) -> bool;

    /// Reads the metadata document. Missing document yields the default.
    fn get_remote_meta(&self) -> Option<RemoteMeta>;

    /// Writes the metadata document.
    fn put_remote_meta(&self, meta: &RemoteMeta) -> bool;

    /// Lists up to `limit` changes after `cursor` (from the start if `None`).
    fn list_changes(&self, cursor: Option<&str>, limit: usize) -> Option<ChangePage>;

    /// Fetches a full item.
    fn get_item(&self, id: &str) -> Option<Item>;

    /// Stores an item and records a change. Returns the new remote revision.
    fn put_item(&self, item: &Item) -> Option<String>;

    /// Stores several items. One outcome per input, in order.
    fn put_items(&self, items: &[Item]) -> Vec<PutOutcome> {
        items
            .iter()
            .map(|item| match self.put_item(item) {
                Some(rev) => PutOutcome::stored(&item.id, rev),
                None => PutOutcome::failed(&item.id, format!("{} upload failed", self.kind())),
            })
            .collect()
    }

    /// Removes an item.
    fn delete_item(&self, id: &str) -> bool;

    /// Fetches a binary attachment.
    fn get_resource(&self, id: &str) -> Option<Vec<u8>>;

    /// Stores a binary attachment.
    fn put_resource(&self, id: &str, data: &[u8], mime_type: &str) -> bool;

    /// Removes a binary attachment.
    fn delete_resource(&self, id: &str) -> bool;

    /// Reads the change-log position stored for `device_id`.
    fn get_sync_cursor(&self, device_id: &str) -> Option<SyncCursor>;

    /// Stores the change-log position for `device_id`.
    fn set_sync_cursor(&self, device_id: &str, cursor: &SyncCursor) -> bool;

    /// Takes the lease lock unless another device holds an unexpired one.
    fn acquire_lock(&self, device_id: &str, lease: Duration) -> bool;

    /// Releases the lock if `device_id` holds it.
    fn release_lock(&self, device_id: &str) -> bool;

    /// Reads the lock. Expired locks read as unlocked.
    fn check_lock(&self) -> Option<LockStatus>;

    /// Best-effort check for data written by an earlier session.
    fn has_existing_data(&self) -> bool {
        self.get_remote_meta()
            .and_then(|meta| meta.last_sync_time)
            .is_some()
    }

    /// Deletes change records older than `before` (Unix millis).
    /// Returns how many were removed.
    fn prune_changes(&self, _before: i64) -> usize {
        0
    }
}

/// Converts an internal result into the sentinel form of the contract.
pub(crate) fn sentinel<T>(backend: &str, operation: &str, result: SyncResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(backend, operation, error = %e, "storage adapter call failed");
            None
        }
    }
}

#[derive(Default)]
struct MemoryState {
    meta: Option<RemoteMeta>,
    items: BTreeMap<String, Item>,
    changes: Vec<ChangeRecord>,
    next_change: u64,
    resources: HashMap<String, Vec<u8>>,
    cursors: HashMap<String, SyncCursor>,
    lock: Option<Lock>,
    offline: bool,
    failing_uploads: HashSet<String>,
    failing_fetches: HashSet<String>,
}

/// A complete in-memory backend for testing.
///
/// Shared between several engines it behaves like one remote seen by
/// several devices. Failures can be injected per item or globally.
#[derive(Default)]
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
}

impl MemoryAdapter {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the backend becoming unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Makes uploads of `id` fail.
    pub fn fail_uploads_for(&self, id: impl Into<String>) {
        self.state.lock().failing_uploads.insert(id.into());
    }

    /// Makes downloads of `id` fail.
    pub fn fail_fetches_for(&self, id: impl Into<String>) {
        self.state.lock().failing_fetches.insert(id.into());
    }

    /// Removes every injected per-item failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_uploads.clear();
        state.failing_fetches.clear();
    }

    /// Stores an item as if another device had pushed it.
    pub fn seed_item(&self, item: &Item) -> String {
        let mut state = self.state.lock();
        Self::store_item(&mut state, item)
    }

    /// Overwrites the metadata document.
    pub fn seed_meta(&self, meta: RemoteMeta) {
        self.state.lock().meta = Some(meta);
    }

    /// Installs a lock as if another device held it.
    pub fn seed_lock(&self, lock: Lock) {
        self.state.lock().lock = Some(lock);
    }

    /// Current metadata document, if one was written.
    pub fn meta(&self) -> Option<RemoteMeta> {
        self.state.lock().meta.clone()
    }

    /// Snapshot of a stored item.
    pub fn item(&self, id: &str) -> Option<Item> {
        self.state.lock().items.get(id).cloned()
    }

    /// Number of stored items.
    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Number of change records.
    pub fn change_count(&self) -> usize {
        self.state.lock().changes.len()
    }

    /// Raw lock document.
    pub fn lock_document(&self) -> Option<Lock> {
        self.state.lock().lock.clone()
    }

    fn store_item(state: &mut MemoryState, item: &Item) -> String {
        state.next_change += 1;
        let change_id = format!("{:016}", state.next_change);
        let rev = format!("r{}", state.next_change);

        let mut stored = item.clone();
        stored.remote_rev = Some(rev.clone());
        stored.sync_status = SyncStatus::Clean;
        state.changes.push(stored.to_change_record(change_id));
        state.items.insert(stored.id.clone(), stored);
        rev
    }
}

impl StorageAdapter for MemoryAdapter {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn test_connection(&self) -> bool {
        !self.state.lock().offline
    }

    fn get_remote_meta(&self) -> Option<RemoteMeta> {
        let state = self.state.lock();
        if state.offline {
            return None;
        }
        Some(state.meta.clone().unwrap_or_default())
    }

    fn put_remote_meta(&self, meta: &RemoteMeta) -> bool {
        let mut state = self.state.lock();
        if state.offline {
            return false;
        }
        state.meta = Some(meta.clone());
        true
    }

    fn list_changes(&self, cursor: Option<&str>, limit: usize) -> Option<ChangePage> {
        let state = self.state.lock();
        if state.offline {
            return None;
        }
        let after: Vec<&ChangeRecord> = state
            .changes
            .iter()
            .filter(|c| cursor.map_or(true, |cur| c.change_id.as_str() > cur))
            .collect();
        let changes: Vec<ChangeRecord> = after.iter().take(limit).map(|c| (*c).clone()).collect();
        Some(ChangePage {
            next_cursor: changes.last().map(|c| c.change_id.clone()),
            has_more: after.len() > changes.len(),
            changes,
        })
    }

    fn get_item(&self, id: &str) -> Option<Item> {
        let state = self.state.lock();
        if state.offline || state.failing_fetches.contains(id) {
            return None;
        }
        state.items.get(id).cloned()
    }

    fn put_item(&self, item: &Item) -> Option<String> {
        let mut state = self.state.lock();
        if state.offline || state.failing_uploads.contains(&item.id) {
            return None;
        }
        Some(Self::store_item(&mut state, item))
    }

    fn delete_item(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        !state.offline && state.items.remove(id).is_some()
    }

    fn get_resource(&self, id: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        if state.offline {
            return None;
        }
        state.resources.get(id).cloned()
    }

    fn put_resource(&self, id: &str, data: &[u8], _mime_type: &str) -> bool {
        let mut state = self.state.lock();
        if state.offline {
            return false;
        }
        state.resources.insert(id.to_string(), data.to_vec());
        true
    }

    fn delete_resource(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        !state.offline && state.resources.remove(id).is_some()
    }

    fn get_sync_cursor(&self, device_id: &str) -> Option<SyncCursor> {
        let state = self.state.lock();
        if state.offline {
            return None;
        }
        state.cursors.get(device_id).cloned()
    }

    fn set_sync_cursor(&self, device_id: &str, cursor: &SyncCursor) -> bool {
        let mut state = self.state.lock();
        if state.offline {
            return false;
        }
        state.cursors.insert(device_id.to_string(), cursor.clone());
        true
    }

    fn acquire_lock(&self, device_id: &str, lease: Duration) -> bool {
        let mut state = self.state.lock();
        if state.offline {
            return false;
        }
        let now = now_millis();
        if let Some(existing) = &state.lock {
            if !existing.is_reclaimable_by(device_id, now) {
                return false;
            }
        }
        state.lock = Some(Lock::new(device_id, now, lease.as_millis() as i64));
        true
    }

    fn release_lock(&self, device_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.offline {
            return false;
        }
        match &state.lock {
            Some(lock) if lock.owner != device_id => false,
            _ => {
                state.lock = None;
                true
            }
        }
    }

    fn check_lock(&self) -> Option<LockStatus> {
        let state = self.state.lock();
        if state.offline {
            return None;
        }
        Some(
            state
                .lock
                .as_ref()
                .map(|lock| lock.status_at(now_millis()))
                .unwrap_or_default(),
        )
    }

    fn has_existing_data(&self) -> bool {
        let state = self.state.lock();
        !state.offline && !state.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    #[test]
    fn put_appends_change_and_assigns_rev() {
        let adapter = MemoryAdapter::new();
        let item = Item::with_id("a", "note", "{}");
        let rev = adapter.put_item(&item).unwrap();

        let stored = adapter.get_item("a").unwrap();
        assert_eq!(stored.remote_rev.as_deref(), Some(rev.as_str()));
        assert_eq!(adapter.change_count(), 1);
        assert!(adapter.has_existing_data());
    }

    #[test]
    fn list_changes_resumes_after_cursor() {
        let adapter = MemoryAdapter::new();
        for i in 0..5 {
            adapter.put_item(&Item::with_id(format!("i{i}"), "note", "{}"));
        }

        let first = adapter.list_changes(None, 2).unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);

        let rest = adapter
            .list_changes(first.next_cursor.as_deref(), 10)
            .unwrap();
        assert_eq!(rest.changes.len(), 3);
        assert!(!rest.has_more);
        assert_eq!(rest.changes[0].item_id, "i2");
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let adapter = MemoryAdapter::new();
        assert!(adapter.acquire_lock("a", LEASE));
        assert!(!adapter.acquire_lock("b", LEASE));
        assert!(adapter.acquire_lock("a", LEASE));
        assert!(!adapter.release_lock("b"));
        assert!(adapter.check_lock().unwrap().is_held_by("a"));

        assert!(adapter.release_lock("a"));
        assert!(adapter.acquire_lock("b", LEASE));
    }

    #[test]
    fn expired_lock_is_reclaimed() {
        let adapter = MemoryAdapter::new();
        adapter.seed_lock(Lock::new("crashed", now_millis() - 10_000, 1_000));
        assert!(!adapter.check_lock().unwrap().locked);
        assert!(adapter.acquire_lock("b", LEASE));
    }

    #[test]
    fn offline_returns_sentinels() {
        let adapter = MemoryAdapter::new();
        adapter.set_offline(true);
        assert!(!adapter.test_connection());
        assert!(adapter.get_remote_meta().is_none());
        assert!(adapter.list_changes(None, 10).is_none());
        assert!(adapter.put_item(&Item::new("note", "{}")).is_none());
        assert!(!adapter.acquire_lock("a", LEASE));
        assert!(adapter.check_lock().is_none());
    }

    #[test]
    fn default_put_items_reports_each_outcome() {
        let adapter = MemoryAdapter::new();
        adapter.fail_uploads_for("bad");
        let items = [
            Item::with_id("good", "note", "{}"),
            Item::with_id("bad", "note", "{}"),
        ];
        let outcomes = adapter.put_items(&items);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].remote_rev.is_some());
        assert!(outcomes[1].error.is_some());
    }
}
