//! JSON-file-backed local item store.

use kbsync_engine::{LocalStore, MemoryStore, SyncResult};
use kbsync_protocol::Item;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A [`LocalStore`] that keeps every item in memory and rewrites one
/// JSON file after each mutation.
///
/// The file is replaced atomically through a temporary sibling, so a
/// crash leaves either the old or the new contents.
pub struct FileStore {
    path: PathBuf,
    items: MemoryStore,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens the store at `path`, starting empty if the file is missing.
    pub fn open(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let items = if path.exists() {
            let text = fs::read(&path)?;
            let items: Vec<Item> = serde_json::from_slice(&text)?;
            debug!(path = %path.display(), count = items.len(), "loaded local store");
            MemoryStore::from_items(items)
        } else {
            MemoryStore::new()
        };
        Ok(Self {
            path,
            items,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of items, tombstones included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Runs a mutation and persists the result.
    fn mutate<T>(&self, f: impl FnOnce(&MemoryStore) -> SyncResult<T>) -> SyncResult<T> {
        let _guard = self.write_lock.lock();
        let value = f(&self.items)?;
        self.persist()?;
        Ok(value)
    }

    fn persist(&self) -> SyncResult<()> {
        let mut items = self.items.snapshot();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&items)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn get_pending_sync(&self) -> SyncResult<Vec<Item>> {
        self.items.get_pending_sync()
    }

    fn get_by_id(&self, id: &str) -> SyncResult<Option<Item>> {
        self.items.get_by_id(id)
    }

    fn update(&self, id: &str, payload: &str) -> SyncResult<Option<Item>> {
        self.mutate(|items| items.update(id, payload))
    }

    fn create(&self, item_type: &str, payload: &str) -> SyncResult<Item> {
        self.mutate(|items| items.create(item_type, payload))
    }

    fn create_with_id(&self, item: Item) -> SyncResult<Item> {
        self.mutate(|items| items.create_with_id(item))
    }

    fn soft_delete(&self, id: &str) -> SyncResult<bool> {
        self.mutate(|items| items.soft_delete(id))
    }

    fn mark_synced(&self, id: &str, remote_rev: &str) -> SyncResult<()> {
        self.mutate(|items| items.mark_synced(id, remote_rev))
    }

    fn mark_conflict(&self, id: &str) -> SyncResult<()> {
        self.mutate(|items| items.mark_conflict(id))
    }

    fn mark_all_for_sync(&self) -> SyncResult<usize> {
        self.mutate(|items| items.mark_all_for_sync())
    }

    fn reset_sync_status(&self) -> SyncResult<usize> {
        self.mutate(|items| items.reset_sync_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbsync_protocol::SyncStatus;
    use tempfile::tempdir;

    #[test]
    fn mutations_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.json");

        let store = FileStore::open(&path).unwrap();
        let note = store.create("note", r#"{"title":"a"}"#).unwrap();
        store.create("todo", "{}").unwrap();
        store.mark_synced(&note.id, "r1").unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        let item = reopened.get_by_id(&note.id).unwrap().unwrap();
        assert_eq!(item.sync_status, SyncStatus::Clean);
        assert_eq!(item.remote_rev.as_deref(), Some("r1"));
        assert_eq!(reopened.pending_count().unwrap(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("none.json")).unwrap();
        assert_eq!(store.len(), 0);
        assert!(!store.path().exists());
    }

    #[test]
    fn failed_mutation_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.json");
        let store = FileStore::open(&path).unwrap();

        assert!(store.mark_conflict("ghost").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.json");
        fs::write(&path, "not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
