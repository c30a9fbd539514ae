//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised by [`CryptoEngine`](crate::CryptoEngine) and key handling.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material has the wrong length.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// No master key is loaded.
    #[error("no master key set")]
    NoKey,

    /// Encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption or authentication failed (wrong key or tampered data).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Envelope could not be parsed.
    #[error("malformed encrypted payload: {0}")]
    MalformedPayload(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

impl CryptoError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload(message.into())
    }
}
