//! Persistent device identity.

use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::info;

/// Stable identifier of this device.
///
/// Generated once and persisted; a device keeps its id across restarts so
/// that its change-log cursor and lock ownership survive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Loads the id stored at `path`, creating and persisting one if the
    /// file does not exist.
    ///
    /// An existing but empty file is an error rather than a reason to
    /// mint a new identity.
    pub fn load_or_create(path: &Path) -> SyncResult<Self> {
        match Self::load(path) {
            Ok(id) => return Ok(id),
            Err(SyncError::Io(e)) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let id = Self::generate();
        let created = OpenOptions::new().write(true).create_new(true).open(path);
        match created {
            Ok(mut file) => {
                file.write_all(id.0.as_bytes())?;
                file.sync_all()?;
                info!(device_id = %id, path = %path.display(), "created device id");
                Ok(id)
            }
            // Another process won the race.
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Self::load(path),
            Err(e) => Err(e.into()),
        }
    }

    fn load(path: &Path) -> SyncResult<Self> {
        let text = fs::read_to_string(path)?;
        let id = text.trim();
        if id.is_empty() {
            return Err(SyncError::Config(format!(
                "device id file {} is empty",
                path.display()
            )));
        }
        Ok(Self(id.to_string()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn created_once_then_reused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("device_id");

        let first = DeviceId::load_or_create(&path).unwrap();
        assert!(uuid::Uuid::parse_str(first.as_str()).is_ok());

        let second = DeviceId::load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn existing_file_is_trimmed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_id");
        fs::write(&path, "  laptop-1\n").unwrap();

        assert_eq!(DeviceId::load_or_create(&path).unwrap().as_str(), "laptop-1");
    }

    #[test]
    fn empty_file_is_not_regenerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_id");
        fs::write(&path, "\n").unwrap();

        assert!(matches!(
            DeviceId::load_or_create(&path),
            Err(SyncError::Config(_))
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "\n");
    }
}
