//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A sync module name was not recognized.
    #[error("unknown sync module: {0}")]
    UnknownModule(String),

    /// A conflict policy name was not recognized.
    #[error("unknown conflict policy: {0}")]
    UnknownPolicy(String),

    /// A protocol version string could not be parsed.
    #[error("invalid protocol version: {0}")]
    InvalidVersion(String),
}
