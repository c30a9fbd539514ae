//! Error types for the sync server.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed path, query or body.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Valid credentials without access.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No such item, resource or document.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unknown route or unsupported method.
    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// The sync lock belongs to another device.
    #[error("lock held by {owner}")]
    LockHeld {
        /// Current holder.
        owner: String,
    },

    /// Request body exceeds a configured limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotAuthorized(_) => 403,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed { .. } => 405,
            ServerError::LockHeld { .. } => 409,
            ServerError::PayloadTooLarge(_) => 413,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status() >= 500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert_eq!(
            ServerError::LockHeld {
                owner: "phone".into()
            }
            .status(),
            409
        );
    }

    #[test]
    fn error_display() {
        let err = ServerError::MethodNotAllowed {
            method: "PATCH".into(),
            path: "/api/items".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("PATCH"));
        assert!(msg.contains("/api/items"));
    }
}
