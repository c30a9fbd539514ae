//! The local item store the engine reads from and writes into.

use crate::error::{SyncError, SyncResult};
use kbsync_crypto::content_hash;
use kbsync_protocol::{now_millis, Item, SyncStatus};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Operations the engine needs from the host application's item store.
///
/// Implementations own persistence. Every mutation that changes content
/// must recompute the plaintext hash and bump `local_rev`.
pub trait LocalStore: Send + Sync {
    /// Items with status `modified` or `deleted`, oldest edit first.
    fn get_pending_sync(&self) -> SyncResult<Vec<Item>>;

    /// Looks up an item, tombstones included.
    fn get_by_id(&self, id: &str) -> SyncResult<Option<Item>>;

    /// Replaces the payload of an existing item.
    ///
    /// Returns `None` if the item does not exist. An unchanged payload
    /// leaves the item untouched.
    fn update(&self, id: &str, payload: &str) -> SyncResult<Option<Item>>;

    /// Creates a new item with a fresh id, pending its first push.
    fn create(&self, item_type: &str, payload: &str) -> SyncResult<Item>;

    /// Inserts an item received from the remote under its own id, as clean.
    fn create_with_id(&self, item: Item) -> SyncResult<Item>;

    /// Marks an item deleted.
    fn soft_delete(&self, id: &str) -> SyncResult<bool>;

    /// Records a successful push or pull.
    fn mark_synced(&self, id: &str, remote_rev: &str) -> SyncResult<()>;

    /// Flags an item whose conflict could not be resolved.
    fn mark_conflict(&self, id: &str) -> SyncResult<()>;

    /// Queues every live clean item for upload. Returns how many changed.
    fn mark_all_for_sync(&self) -> SyncResult<usize>;

    /// Forgets remote revisions and queues every live item for upload.
    fn reset_sync_status(&self) -> SyncResult<usize>;

    /// Number of items waiting to be pushed.
    fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.get_pending_sync()?.len())
    }
}

/// In-memory [`LocalStore`].
///
/// Used by tests and as the working set of file-backed stores.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, Item>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `items` as-is.
    pub fn from_items(items: impl IntoIterator<Item = Item>) -> Self {
        let items = items
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        Self {
            items: RwLock::new(items),
        }
    }

    /// All items, ordered by id.
    pub fn snapshot(&self) -> Vec<Item> {
        self.items.read().values().cloned().collect()
    }

    /// Number of items, tombstones included.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Returns true if the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Inserts an item exactly as given.
    pub fn insert(&self, item: Item) {
        self.items.write().insert(item.id.clone(), item);
    }

    fn with_item<T>(&self, id: &str, f: impl FnOnce(&mut Item) -> T) -> SyncResult<T> {
        let mut items = self.items.write();
        let item = items
            .get_mut(id)
            .ok_or_else(|| SyncError::store(format!("no local item {id}")))?;
        Ok(f(item))
    }
}

impl LocalStore for MemoryStore {
    fn get_pending_sync(&self) -> SyncResult<Vec<Item>> {
        let mut pending: Vec<Item> = self
            .items
            .read()
            .values()
            .filter(|item| item.sync_status.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|item| item.updated_time);
        Ok(pending)
    }

    fn get_by_id(&self, id: &str) -> SyncResult<Option<Item>> {
        Ok(self.items.read().get(id).cloned())
    }

    fn update(&self, id: &str, payload: &str) -> SyncResult<Option<Item>> {
        let mut items = self.items.write();
        let Some(item) = items.get_mut(id) else {
            return Ok(None);
        };
        let hash = content_hash(payload.as_bytes());
        if hash != item.content_hash {
            item.payload = payload.to_string();
            item.content_hash = hash;
            item.updated_time = now_millis().max(item.updated_time);
            item.local_rev += 1;
            item.sync_status = SyncStatus::Modified;
        }
        Ok(Some(item.clone()))
    }

    fn create(&self, item_type: &str, payload: &str) -> SyncResult<Item> {
        let item = Item::new(item_type, payload);
        self.items.write().insert(item.id.clone(), item.clone());
        Ok(item)
    }

    fn create_with_id(&self, mut item: Item) -> SyncResult<Item> {
        item.content_hash = content_hash(item.payload.as_bytes());
        item.sync_status = SyncStatus::Clean;
        item.encryption_applied = false;
        self.items.write().insert(item.id.clone(), item.clone());
        Ok(item)
    }

    fn soft_delete(&self, id: &str) -> SyncResult<bool> {
        let mut items = self.items.write();
        let Some(item) = items.get_mut(id) else {
            return Ok(false);
        };
        let now = now_millis().max(item.updated_time);
        item.deleted_time = Some(now);
        item.updated_time = now;
        item.local_rev += 1;
        item.sync_status = SyncStatus::Deleted;
        Ok(true)
    }

    fn mark_synced(&self, id: &str, remote_rev: &str) -> SyncResult<()> {
        self.with_item(id, |item| {
            item.sync_status = SyncStatus::Clean;
            item.remote_rev = Some(remote_rev.to_string());
        })
    }

    fn mark_conflict(&self, id: &str) -> SyncResult<()> {
        self.with_item(id, |item| item.sync_status = SyncStatus::Conflict)
    }

    fn mark_all_for_sync(&self) -> SyncResult<usize> {
        let mut count = 0;
        for item in self.items.write().values_mut() {
            if item.sync_status == SyncStatus::Clean && !item.is_deleted() {
                item.sync_status = SyncStatus::Modified;
                count += 1;
            }
        }
        Ok(count)
    }

    fn reset_sync_status(&self) -> SyncResult<usize> {
        let mut count = 0;
        for item in self.items.write().values_mut() {
            item.remote_rev = None;
            if !item.is_deleted() {
                item.sync_status = SyncStatus::Modified;
                count += 1;
            }
        }
        Ok(count)
    }
}
