//! Session phases and progress events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    /// Checking the backend is reachable and compatible.
    #[default]
    Connecting,
    /// Taking the remote lease lock.
    AcquiringLock,
    /// Comparing key fingerprints.
    VerifyingKey,
    /// Uploading local changes.
    Pushing,
    /// Applying the remote change log.
    Pulling,
    /// Stamping the remote metadata.
    Committing,
    /// Session finished.
    Done,
    /// Session aborted.
    Error,
}

impl SyncPhase {
    /// Returns true while a session is between connecting and committing.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncPhase::Done | SyncPhase::Error)
    }

    /// Kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Connecting => "connecting",
            SyncPhase::AcquiringLock => "acquiring-lock",
            SyncPhase::VerifyingKey => "verifying-key",
            SyncPhase::Pushing => "pushing",
            SyncPhase::Pulling => "pulling",
            SyncPhase::Committing => "committing",
            SyncPhase::Done => "done",
            SyncPhase::Error => "error",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress event emitted during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Current phase.
    pub phase: SyncPhase,
    /// Human-readable status line.
    pub message: String,
    /// Items processed so far in this phase.
    pub current: Option<usize>,
    /// Items expected in this phase, when known.
    pub total: Option<usize>,
    /// Extra detail, such as an item id.
    pub detail: Option<String>,
}

impl SyncProgress {
    /// Creates an event with only a phase and message.
    pub fn new(phase: SyncPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            current: None,
            total: None,
            detail: None,
        }
    }

    /// Adds a counter.
    pub fn with_count(mut self, current: usize, total: Option<usize>) -> Self {
        self.current = Some(current);
        self.total = total;
        self
    }

    /// Adds a detail string.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
