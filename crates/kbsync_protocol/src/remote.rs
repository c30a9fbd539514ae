//! Documents stored on the remote side: cursor, metadata and lock.

use crate::error::{ProtocolError, ProtocolResult};
use crate::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};

/// Bookmark into the remote change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Opaque position token returned as `next_cursor`.
    #[serde(rename = "cursor")]
    pub position: String,
    /// When the cursor was last advanced, Unix millis.
    pub timestamp: i64,
}

impl SyncCursor {
    /// Creates a cursor stamped with the given time.
    pub fn new(position: impl Into<String>, timestamp: i64) -> Self {
        Self {
            position: position.into(),
            timestamp,
        }
    }
}

/// Backend-wide metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMeta {
    /// Protocol version, `major.minor`.
    pub version: String,
    /// Capabilities the backend offers.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Completion time of the last committed session.
    #[serde(default)]
    pub last_sync_time: Option<i64>,
    /// Fingerprint of the encryption key used by this backend.
    #[serde(default)]
    pub key_identifier: Option<String>,
}

impl Default for RemoteMeta {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            capabilities: vec!["items".into(), "resources".into(), "changes".into()],
            last_sync_time: None,
            key_identifier: None,
        }
    }
}

impl RemoteMeta {
    /// Major component of [`version`](Self::version).
    pub fn major_version(&self) -> ProtocolResult<u32> {
        parse_major(&self.version)
    }

    /// Returns true if this client can talk to a backend with this metadata.
    ///
    /// A backend written by a newer major protocol version is rejected.
    pub fn is_compatible(&self) -> bool {
        match (self.major_version(), parse_major(PROTOCOL_VERSION)) {
            (Ok(remote), Ok(local)) => remote <= local,
            _ => false,
        }
    }
}

fn parse_major(version: &str) -> ProtocolResult<u32> {
    version
        .split('.')
        .next()
        .and_then(|major| major.trim().parse().ok())
        .ok_or_else(|| ProtocolError::InvalidVersion(version.to_string()))
}

/// Leased distributed mutex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Device id of the holder.
    pub owner: String,
    /// Acquisition time, Unix millis.
    pub acquired: i64,
    /// Expiry time, Unix millis.
    pub expires: i64,
}

impl Lock {
    /// Creates a lock for `owner` lasting `lease_ms` from `now`.
    pub fn new(owner: impl Into<String>, now: i64, lease_ms: i64) -> Self {
        Self {
            owner: owner.into(),
            acquired: now,
            expires: now.saturating_add(lease_ms),
        }
    }

    /// Returns true once the lease has run out.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires <= now
    }

    /// Returns true if `device_id` may take this lock at `now`.
    pub fn is_reclaimable_by(&self, device_id: &str, now: i64) -> bool {
        self.is_expired(now) || self.owner == device_id
    }

    /// Status view of this lock at `now`. Expired locks read as unlocked.
    pub fn status_at(&self, now: i64) -> LockStatus {
        if self.is_expired(now) {
            LockStatus::unlocked()
        } else {
            LockStatus {
                locked: true,
                owner: Some(self.owner.clone()),
                expires: Some(self.expires),
            }
        }
    }
}

/// Result of a lock check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LockStatus {
    /// Whether an unexpired lock exists.
    pub locked: bool,
    /// Holder of the lock.
    #[serde(default)]
    pub owner: Option<String>,
    /// Lock expiry, Unix millis.
    #[serde(default)]
    pub expires: Option<i64>,
}

impl LockStatus {
    /// No lock held.
    pub fn unlocked() -> Self {
        Self::default()
    }

    /// Returns true if the lock is currently held by `device_id`.
    pub fn is_held_by(&self, device_id: &str) -> bool {
        self.locked && self.owner.as_deref() == Some(device_id)
    }
}

/// Per-item result of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Item id.
    pub id: String,
    /// Remote revision on success, `None` on failure.
    pub remote_rev: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
}

impl PutOutcome {
    /// A successful upload.
    pub fn stored(id: impl Into<String>, remote_rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote_rev: Some(remote_rev.into()),
            error: None,
        }
    }

    /// A failed upload.
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote_rev: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_meta() {
        let meta = RemoteMeta::default();
        assert_eq!(meta.version, "1.0");
        assert_eq!(meta.capabilities, vec!["items", "resources", "changes"]);
        assert!(meta.last_sync_time.is_none());
        assert!(meta.is_compatible());
    }

    #[test]
    fn newer_major_is_incompatible() {
        let mut meta = RemoteMeta::default();
        meta.version = "2.0".into();
        assert!(!meta.is_compatible());
        meta.version = "1.7".into();
        assert!(meta.is_compatible());
        meta.version = "garbage".into();
        assert!(!meta.is_compatible());
        assert!(meta.major_version().is_err());
    }

    #[test]
    fn lock_expiry_and_reclaim() {
        let lock = Lock::new("dev-a", 1_000, 500);
        assert_eq!(lock.expires, 1_500);
        assert!(!lock.is_expired(1_499));
        assert!(lock.is_expired(1_500));

        assert!(lock.is_reclaimable_by("dev-a", 1_200));
        assert!(!lock.is_reclaimable_by("dev-b", 1_200));
        assert!(lock.is_reclaimable_by("dev-b", 2_000));
    }

    #[test]
    fn expired_lock_reads_unlocked() {
        let lock = Lock::new("dev-a", 0, 10);
        assert!(lock.status_at(5).is_held_by("dev-a"));
        assert!(!lock.status_at(5).is_held_by("dev-b"));
        assert_eq!(lock.status_at(50), LockStatus::unlocked());
    }

    #[test]
    fn cursor_wire_key() {
        let cursor = SyncCursor::new("0000000000000042-ab", 7);
        let json = serde_json::to_value(&cursor).unwrap();
        assert_eq!(json["cursor"], "0000000000000042-ab");
        assert_eq!(json["timestamp"], 7);
    }
}
