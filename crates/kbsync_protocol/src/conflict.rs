//! Conflict policies and conflict records.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A local edit and a remote change that touched the same item within one
/// sync window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Id of the contested item.
    pub item_id: String,
    /// Type of the contested item.
    pub item_type: String,
    /// Plaintext hash of the local edit.
    pub local_hash: String,
    /// Plaintext hash announced by the remote change.
    pub remote_hash: String,
    /// How the conflict was settled.
    pub resolution: ConflictResolution,
}

impl Conflict {
    /// Creates a conflict record.
    pub fn new(
        item_id: impl Into<String>,
        item_type: impl Into<String>,
        local_hash: impl Into<String>,
        remote_hash: impl Into<String>,
        resolution: ConflictResolution,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            item_type: item_type.into(),
            local_hash: local_hash.into(),
            remote_hash: remote_hash.into(),
            resolution,
        }
    }

    /// Returns true if neither edit was lost.
    pub fn preserved_both(&self) -> bool {
        matches!(self.resolution, ConflictResolution::CopiedLocal { .. })
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Remote payload overwrote the local edit.
    AcceptedRemote,
    /// Remote change ignored; the local edit is pushed next session.
    KeptLocal,
    /// Local edit saved as a new item, remote payload written to the original id.
    CopiedLocal {
        /// Id of the conflict copy.
        copy_id: String,
    },
    /// Could not be resolved; the local item was flagged.
    Unresolved,
}

/// How conflicts between a local edit and a remote change are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Remote payload overwrites the local edit.
    RemoteWins,
    /// Local edit is kept and overwrites remote on the next push.
    LocalWins,
    /// Local edit is preserved as a separate copy.
    #[default]
    CreateCopy,
}

impl ConflictPolicy {
    /// Returns true if the policy can discard one side of a conflict.
    pub fn may_discard(&self) -> bool {
        !matches!(self, ConflictPolicy::CreateCopy)
    }

    /// Kebab-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::RemoteWins => "remote-wins",
            ConflictPolicy::LocalWins => "local-wins",
            ConflictPolicy::CreateCopy => "create-copy",
        }
    }

    /// Compact code for persisted settings.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictPolicy::RemoteWins => 1,
            ConflictPolicy::LocalWins => 2,
            ConflictPolicy::CreateCopy => 3,
        }
    }

    /// Decodes a code written by [`to_code`](Self::to_code).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictPolicy::RemoteWins),
            2 => Some(ConflictPolicy::LocalWins),
            3 => Some(ConflictPolicy::CreateCopy),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote-wins" => Ok(ConflictPolicy::RemoteWins),
            "local-wins" => Ok(ConflictPolicy::LocalWins),
            "create-copy" => Ok(ConflictPolicy::CreateCopy),
            other => Err(ProtocolError::UnknownPolicy(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_preserves_both() {
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::CreateCopy);
        assert!(!ConflictPolicy::CreateCopy.may_discard());
        assert!(ConflictPolicy::RemoteWins.may_discard());
    }

    #[test]
    fn policy_codes() {
        for policy in [
            ConflictPolicy::RemoteWins,
            ConflictPolicy::LocalWins,
            ConflictPolicy::CreateCopy,
        ] {
            assert_eq!(ConflictPolicy::from_code(policy.to_code()), Some(policy));
            assert_eq!(policy.as_str().parse::<ConflictPolicy>().unwrap(), policy);
        }
        assert_eq!(ConflictPolicy::from_code(0), None);
        assert!("manual".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn policy_wire_name() {
        assert_eq!(
            serde_json::to_string(&ConflictPolicy::RemoteWins).unwrap(),
            r#""remote-wins""#
        );
    }

    #[test]
    fn conflict_records_resolution() {
        let conflict = Conflict::new(
            "n1",
            "note",
            "aaa",
            "bbb",
            ConflictResolution::CopiedLocal {
                copy_id: "n2".into(),
            },
        );
        assert!(conflict.preserved_both());

        let dropped = Conflict::new("n1", "note", "a", "b", ConflictResolution::AcceptedRemote);
        assert!(!dropped.preserved_both());
    }
}
