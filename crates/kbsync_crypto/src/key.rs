//! Master key material and password-based key derivation.

use crate::error::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce (IV) in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Size of a password salt in bytes.
pub const SALT_SIZE: usize = 32;
/// PBKDF2 iteration count. Fixed at build time.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const FINGERPRINT_INFO: &[u8] = b"kbsync-key-fingerprint-v1";
const FINGERPRINT_LEN: usize = 8;

/// A 256-bit master key.
///
/// The bytes are overwritten when the key is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Decodes a key from standard base64.
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let mut raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::malformed(format!("key is not base64: {e}")))?;
        let key = Self::from_bytes(&raw);
        raw.zeroize();
        key
    }

    /// Encodes the key as standard base64.
    ///
    /// The result is as sensitive as the key itself.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Returns a short, non-reversible identifier for this key.
    ///
    /// Two devices holding the same key produce the same fingerprint,
    /// so it can be stored remotely and compared without exposing the key.
    pub fn fingerprint(&self) -> CryptoResult<String> {
        let hk = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut out = [0u8; FINGERPRINT_LEN];
        hk.expand(FINGERPRINT_INFO, &mut out)
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".into()))?;
        Ok(hex::encode(out))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generates a fresh random salt for [`derive_key`].
#[must_use]
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derives a key from a password with PBKDF2-HMAC-SHA256.
///
/// Uses [`PBKDF2_ITERATIONS`] rounds. The same password and salt always
/// yield the same key.
#[must_use]
pub fn derive_key(password: &[u8], salt: &[u8]) -> MasterKey {
    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut bytes);
    MasterKey { bytes }
}
