//! Error types for the sync engine.

use kbsync_crypto::CryptoError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Adapters never return these across the [`StorageAdapter`] boundary;
/// they are used internally and by the engine to describe fatal and
/// per-item failures.
///
/// [`StorageAdapter`]: crate::StorageAdapter
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Backend answered with a non-success status.
    #[error("http status {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Response could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Backend could not be reached or prepared.
    #[error("could not connect to {0} backend")]
    NotConnected(String),

    /// Backend speaks a newer protocol.
    #[error("remote protocol version {0} is not supported")]
    IncompatibleRemote(String),

    /// Another device holds the sync lock.
    #[error("sync lock unavailable{}", owner.as_ref().map(|o| format!(" (held by {o})")).unwrap_or_default())]
    LockUnavailable {
        /// Current holder, when known.
        owner: Option<String>,
    },

    /// Local and remote key fingerprints differ.
    #[error("encryption key mismatch: local {local}, remote {remote}")]
    KeyMismatch {
        /// Local key fingerprint.
        local: String,
        /// Fingerprint recorded on the backend.
        remote: String,
    },

    /// Encryption is enabled but no key is loaded.
    #[error("encryption is enabled but no key is loaded")]
    MissingKey,

    /// Encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A remote item referenced by the change log is gone.
    #[error("remote item not found: {0}")]
    ItemNotFound(String),

    /// Local store failure.
    #[error("local store error: {0}")]
    Store(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A session is already running on this engine.
    #[error("sync already in progress")]
    AlreadyRunning,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a local store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error aborts a whole session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::LockUnavailable { .. }
                | SyncError::KeyMismatch { .. }
                | SyncError::MissingKey
                | SyncError::NotConnected(_)
                | SyncError::IncompatibleRemote(_)
                | SyncError::AlreadyRunning
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Http {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!SyncError::Http {
            status: 404,
            message: "missing".into()
        }
        .is_retryable());
        assert!(!SyncError::MissingKey.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(SyncError::LockUnavailable { owner: None }.is_session_fatal());
        assert!(SyncError::KeyMismatch {
            local: "a".into(),
            remote: "b".into()
        }
        .is_session_fatal());
        assert!(!SyncError::ItemNotFound("x".into()).is_session_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::LockUnavailable {
            owner: Some("laptop".into()),
        };
        assert_eq!(err.to_string(), "sync lock unavailable (held by laptop)");
        assert_eq!(
            SyncError::LockUnavailable { owner: None }.to_string(),
            "sync lock unavailable"
        );

        let err = SyncError::KeyMismatch {
            local: "aaaa".into(),
            remote: "bbbb".into(),
        };
        assert!(err.to_string().contains("aaaa"));
        assert!(err.to_string().contains("bbbb"));
    }
}
