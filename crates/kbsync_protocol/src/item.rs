//! Items and change records.

use crate::now_millis;
use kbsync_crypto::content_hash;
use serde::{Deserialize, Serialize};

/// Replication state of a local item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// In sync with the remote copy.
    #[default]
    Clean,
    /// Edited locally since the last push.
    Modified,
    /// Soft-deleted locally since the last push.
    Deleted,
    /// Left unresolved after a failed conflict resolution.
    Conflict,
}

impl SyncStatus {
    /// Returns true if the item must be pushed.
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncStatus::Modified | SyncStatus::Deleted)
    }
}

/// The unit of replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Stable, globally unique id.
    pub id: String,
    /// Payload shape discriminator and module membership key.
    #[serde(rename = "type")]
    pub item_type: String,
    /// Creation time, Unix millis.
    pub created_time: i64,
    /// Last mutation time, Unix millis.
    pub updated_time: i64,
    /// Soft-delete marker, Unix millis.
    #[serde(default)]
    pub deleted_time: Option<i64>,
    /// Serialized content, plaintext or an encrypted envelope.
    pub payload: String,
    /// SHA-256 hex of the plaintext payload.
    pub content_hash: String,
    /// Replication state.
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Local mutation counter.
    #[serde(default)]
    pub local_rev: u64,
    /// Backend revision token from the last successful push.
    #[serde(default)]
    pub remote_rev: Option<String>,
    /// Whether `payload` holds ciphertext in this copy.
    #[serde(default)]
    pub encryption_applied: bool,
    /// Payload schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

impl Item {
    /// Creates a new local item with a fresh id, pending its first push.
    pub fn new(item_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), item_type, payload)
    }

    /// Creates a new local item with the given id, pending its first push.
    pub fn with_id(
        id: impl Into<String>,
        item_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let payload = payload.into();
        let now = now_millis();
        Self {
            id: id.into(),
            item_type: item_type.into(),
            created_time: now,
            updated_time: now,
            deleted_time: None,
            content_hash: content_hash(payload.as_bytes()),
            payload,
            sync_status: SyncStatus::Modified,
            local_rev: 1,
            remote_rev: None,
            encryption_applied: false,
            schema_version: default_schema_version(),
        }
    }

    /// Returns true if the item carries a soft-delete marker.
    pub fn is_deleted(&self) -> bool {
        self.deleted_time.is_some()
    }

    /// Projects the item into a change-log entry.
    pub fn to_change_record(&self, change_id: impl Into<String>) -> ChangeRecord {
        ChangeRecord {
            change_id: change_id.into(),
            item_id: self.id.clone(),
            item_type: self.item_type.clone(),
            updated_time: self.updated_time,
            deleted_time: self.deleted_time,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Minimal projection of an item stored in the remote change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position of this record in the log.
    pub change_id: String,
    /// Id of the changed item.
    pub item_id: String,
    /// Type of the changed item.
    #[serde(rename = "type")]
    pub item_type: String,
    /// Item `updated_time` at the time of the change.
    pub updated_time: i64,
    /// Item `deleted_time` at the time of the change.
    #[serde(default)]
    pub deleted_time: Option<i64>,
    /// Plaintext content hash at the time of the change.
    pub content_hash: String,
}

/// One page of a change-log listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    /// Changes in log order.
    pub changes: Vec<ChangeRecord>,
    /// Cursor to resume after the last returned change.
    #[serde(default)]
    pub next_cursor: Option<String>,
    /// Whether more changes follow.
    #[serde(default)]
    pub has_more: bool,
}

impl ChangePage {
    /// An empty, final page.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_is_pending_with_plaintext_hash() {
        let item = Item::new("note", r#"{"title":"a"}"#);
        assert_eq!(item.sync_status, SyncStatus::Modified);
        assert_eq!(item.local_rev, 1);
        assert_eq!(item.content_hash, content_hash(br#"{"title":"a"}"#));
        assert!(!item.is_deleted());
        assert!(uuid::Uuid::parse_str(&item.id).is_ok());
    }

    #[test]
    fn item_json_uses_type_key() {
        let item = Item::with_id("n1", "note", "{}");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "note");
        assert_eq!(json["sync_status"], "modified");
        assert!(json.get("item_type").is_none());
    }

    #[test]
    fn item_decodes_with_defaults() {
        let json = r#"{"id":"x","type":"todo","created_time":1,"updated_time":2,
            "payload":"{}","content_hash":"h"}"#;
        let item: Item = serde_json::from_str(json).unwrap();
        assert_eq!(item.sync_status, SyncStatus::Clean);
        assert_eq!(item.schema_version, 1);
        assert!(item.remote_rev.is_none());
    }

    #[test]
    fn change_record_projection() {
        let mut item = Item::with_id("n1", "note", "body");
        item.deleted_time = Some(99);
        let change = item.to_change_record("0001");
        assert_eq!(change.item_id, "n1");
        assert_eq!(change.deleted_time, Some(99));
        assert_eq!(change.content_hash, item.content_hash);
    }

    #[test]
    fn change_page_wire_keys() {
        let page = ChangePage {
            changes: vec![],
            next_cursor: Some("c".into()),
            has_more: true,
        };
        let json = serde_json::to_string(&page).unwrap();
        assert!(json.contains("nextCursor"));
        assert!(json.contains("hasMore"));
    }

    #[test]
    fn pending_statuses() {
        assert!(SyncStatus::Modified.is_pending());
        assert!(SyncStatus::Deleted.is_pending());
        assert!(!SyncStatus::Clean.is_pending());
        assert!(!SyncStatus::Conflict.is_pending());
    }
}
