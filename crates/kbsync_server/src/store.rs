//! In-memory backend state.

use crate::error::{ServerError, ServerResult};
use kbsync_protocol::{
    ChangePage, ChangeRecord, Item, Lock, LockStatus, RemoteMeta, ServerStatus, SyncCursor,
    SyncStatus,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// A stored attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Raw bytes as uploaded.
    pub data: Vec<u8>,
    /// Content type sent with the upload.
    pub mime_type: String,
}

#[derive(Default)]
struct State {
    items: BTreeMap<String, Item>,
    /// Append-only; sequence numbers start at 1.
    changes: Vec<(u64, ChangeRecord)>,
    next_seq: u64,
    resources: BTreeMap<String, Resource>,
    cursors: HashMap<String, SyncCursor>,
    meta: Option<RemoteMeta>,
    lock: Option<Lock>,
}

/// Items, change log, resources, cursors, metadata and the lease lock.
///
/// Every item write appends one change record whose numeric sequence is
/// both its `change_id` and the item's remote revision. All operations
/// take a single lock, so lock acquisition is atomic.
#[derive(Default)]
pub struct ServerStore {
    state: RwLock<State>,
}

impl ServerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an item and appends a change. Returns the new revision.
    pub fn put_item(&self, mut item: Item) -> String {
        let mut state = self.state.write();
        state.next_seq += 1;
        let seq = state.next_seq;
        let rev = seq.to_string();

        item.remote_rev = Some(rev.clone());
        item.sync_status = SyncStatus::Clean;
        let record = item.to_change_record(rev.as_str());
        state.changes.push((seq, record));
        state.items.insert(item.id.clone(), item);
        rev
    }

    /// Looks up an item.
    pub fn get_item(&self, id: &str) -> Option<Item> {
        self.state.read().items.get(id).cloned()
    }

    /// Removes an item without logging a change.
    pub fn delete_item(&self, id: &str) -> bool {
        self.state.write().items.remove(id).is_some()
    }

    /// Up to `limit` changes strictly after `cursor`.
    pub fn changes_since(&self, cursor: u64, limit: usize) -> ChangePage {
        let state = self.state.read();
        let start = state.changes.partition_point(|(seq, _)| *seq <= cursor);
        let remaining = &state.changes[start..];
        let page = &remaining[..remaining.len().min(limit)];

        ChangePage {
            changes: page.iter().map(|(_, record)| record.clone()).collect(),
            next_cursor: page.last().map(|(seq, _)| seq.to_string()),
            has_more: remaining.len() > page.len(),
        }
    }

    /// Stores an attachment.
    pub fn put_resource(&self, id: &str, resource: Resource) {
        self.state
            .write()
            .resources
            .insert(id.to_string(), resource);
    }

    /// Looks up an attachment.
    pub fn get_resource(&self, id: &str) -> Option<Resource> {
        self.state.read().resources.get(id).cloned()
    }

    /// Removes an attachment.
    pub fn delete_resource(&self, id: &str) -> bool {
        self.state.write().resources.remove(id).is_some()
    }

    /// Change-log position of `device_id`.
    pub fn cursor(&self, device_id: &str) -> Option<SyncCursor> {
        self.state.read().cursors.get(device_id).cloned()
    }

    /// Stores the change-log position of `device_id`.
    pub fn set_cursor(&self, device_id: &str, cursor: SyncCursor) {
        self.state
            .write()
            .cursors
            .insert(device_id.to_string(), cursor);
    }

    /// The metadata document, if one was written.
    pub fn meta(&self) -> Option<RemoteMeta> {
        self.state.read().meta.clone()
    }

    /// Replaces the metadata document.
    pub fn set_meta(&self, meta: RemoteMeta) {
        self.state.write().meta = Some(meta);
    }

    /// Takes the lock for `device_id` unless another device holds an
    /// unexpired one.
    pub fn acquire_lock(&self, device_id: &str, lease_ms: i64, now: i64) -> bool {
        let mut state = self.state.write();
        if let Some(lock) = &state.lock {
            if !lock.is_reclaimable_by(device_id, now) {
                return false;
            }
        }
        state.lock = Some(Lock::new(device_id, now, lease_ms));
        true
    }

    /// Releases the lock held by `device_id`. Releasing a free or
    /// expired lock succeeds.
    pub fn release_lock(&self, device_id: &str, now: i64) -> ServerResult<()> {
        let mut state = self.state.write();
        match &state.lock {
            Some(lock) if !lock.is_expired(now) && lock.owner != device_id => {
                Err(ServerError::LockHeld {
                    owner: lock.owner.clone(),
                })
            }
            _ => {
                state.lock = None;
                Ok(())
            }
        }
    }

    /// Lock status at `now`.
    pub fn lock_status(&self, now: i64) -> LockStatus {
        self.state
            .read()
            .lock
            .as_ref()
            .map_or_else(LockStatus::unlocked, |lock| lock.status_at(now))
    }

    /// Summary counters.
    pub fn status(&self, now: i64) -> ServerStatus {
        let state = self.state.read();
        ServerStatus {
            item_count: state.items.len(),
            change_count: state.changes.len(),
            resource_count: state.resources.len(),
            locked: state.lock.as_ref().is_some_and(|lock| !lock.is_expired(now)),
        }
    }
}
