//! Authentication support for the sync server.
//!
//! Bearer tokens are HMAC-SHA256 signed and carry their issue time for
//! expiry checks.
//!
//! ## Token Format
//!
//! `{device_id}.{issued_at}.{signature}` where `issued_at` is Unix millis
//! and `signature` is the hex HMAC of `{device_id}.{issued_at}`.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use kbsync_protocol::now_millis;
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"[REDACTED]")
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

/// Issues and checks bearer tokens.
#[derive(Clone, Debug)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `device_id` issued now.
    pub fn create_token(&self, device_id: &str) -> ServerResult<String> {
        self.create_token_at(device_id, now_millis())
    }

    fn create_token_at(&self, device_id: &str, issued_at: i64) -> ServerResult<String> {
        if device_id.is_empty() || device_id.contains('.') {
            return Err(ServerError::InvalidRequest(format!(
                "device id {device_id:?} cannot be embedded in a token"
            )));
        }
        let claims = format!("{device_id}.{issued_at}");
        let signature = hex::encode(self.mac(&claims)?.finalize().into_bytes());
        Ok(format!("{claims}.{signature}"))
    }

    /// Validates a token and returns the device id it was issued to.
    pub fn validate_token(&self, token: &str) -> ServerResult<String> {
        let mut parts = token.rsplitn(2, '.');
        let (Some(signature), Some(claims)) = (parts.next(), parts.next()) else {
            return Err(ServerError::AuthenticationFailed("malformed token".into()));
        };
        let Some((device_id, issued_at)) = claims.rsplit_once('.') else {
            return Err(ServerError::AuthenticationFailed("malformed token".into()));
        };
        let issued_at: i64 = issued_at
            .parse()
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;
        let signature = hex::decode(signature)
            .map_err(|_| ServerError::AuthenticationFailed("malformed signature".into()))?;

        self.mac(claims)?
            .verify_slice(&signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let expiry = self.config.token_expiry.as_millis() as i64;
        if now_millis() >= issued_at.saturating_add(expiry) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        Ok(device_id.to_string())
    }

    fn mac(&self, claims: &str) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))?;
        mac.update(claims.as_bytes());
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token("laptop-1").unwrap();
        assert!(token.starts_with("laptop-1."));
        assert_eq!(validator.validate_token(&token).unwrap(), "laptop-1");
    }

    #[test]
    fn reject_other_secret() {
        let token = validator().create_token("laptop-1").unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token("laptop-1").unwrap();
        let forged = token.replacen("laptop-1", "laptop-2", 1);
        assert!(matches!(
            validator.validate_token(&forged),
            Err(ServerError::AuthenticationFailed(_))
        ));
        assert!(validator.validate_token("garbage").is_err());
        assert!(validator.validate_token("a.b.c").is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = validator();
        let token = validator
            .create_token_at("laptop-1", now_millis() - 25 * 60 * 60 * 1000)
            .unwrap();
        let err = validator.validate_token(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn reject_unembeddable_device_id() {
        assert!(validator().create_token("a.b").is_err());
        assert!(validator().create_token("").is_err());
    }
}
