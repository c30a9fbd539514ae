//! Server configuration.

use std::fmt;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Largest page returned by `GET /api/changes`.
    pub max_page_size: usize,
    /// Most items accepted by one batch upload.
    pub max_batch_size: usize,
    /// Longest lease a device may request.
    pub max_lock_lease: Duration,
    /// Static key expected in `X-API-Key`.
    pub api_key: Option<String>,
    /// Secret for HMAC bearer tokens.
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of bearer tokens.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates an open server configuration.
    pub fn new() -> Self {
        Self {
            max_page_size: 500,
            max_batch_size: 100,
            max_lock_lease: Duration::from_secs(30 * 60),
            api_key: None,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the maximum change page size.
    pub fn with_max_page_size(mut self, size: usize) -> Self {
        self.max_page_size = size.max(1);
        self
    }

    /// Sets the maximum batch upload size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Caps requested lock leases.
    pub fn with_max_lock_lease(mut self, lease: Duration) -> Self {
        self.max_lock_lease = lease;
        self
    }

    /// Requires a static API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Accepts HMAC bearer tokens signed with `secret`.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the bearer token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Returns true if requests must carry credentials.
    pub fn require_auth(&self) -> bool {
        self.api_key.is_some() || self.auth_secret.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_page_size", &self.max_page_size)
            .field("max_batch_size", &self.max_batch_size)
            .field("max_lock_lease", &self.max_lock_lease)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("auth_secret", &self.auth_secret.as_ref().map(|_| "[REDACTED]"))
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_page_size, 500);
        assert!(!config.require_auth());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_page_size(0)
            .with_max_batch_size(20)
            .with_api_key("k")
            .with_auth(vec![1, 2, 3, 4]);

        assert_eq!(config.max_page_size, 1);
        assert_eq!(config.max_batch_size, 20);
        assert!(config.require_auth());
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3, 4]));
        assert!(!format!("{config:?}").contains("\"k\""));
    }
}
