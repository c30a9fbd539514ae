//! AES-256-GCM encryption engine.

use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key, generate_salt, MasterKey, NONCE_SIZE, TAG_SIZE};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Encrypted data as stored in an item payload or exported key blob.
///
/// All binary fields are standard base64. `salt` is present only when the
/// key was derived from a password for this envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    /// Ciphertext without the tag.
    pub ciphertext: String,
    /// 12-byte GCM nonce.
    pub iv: String,
    /// 16-byte GCM authentication tag.
    pub auth_tag: String,
    /// PBKDF2 salt for password-encrypted envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

impl EncryptedPayload {
    /// Serializes the envelope to its JSON text form.
    pub fn to_json(&self) -> CryptoResult<String> {
        serde_json::to_string(self).map_err(|e| CryptoError::malformed(e.to_string()))
    }

    /// Parses an envelope from JSON text.
    pub fn from_json(text: &str) -> CryptoResult<Self> {
        serde_json::from_str(text).map_err(|e| CryptoError::malformed(e.to_string()))
    }

    fn decode_field(name: &str, value: &str) -> CryptoResult<Vec<u8>> {
        STANDARD
            .decode(value)
            .map_err(|e| CryptoError::malformed(format!("{name}: {e}")))
    }
}

/// Computes the SHA-256 content hash of a payload, as lowercase hex.
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Holds the device's master key and performs all payload crypto.
///
/// The engine starts without a key. Operations that need one fail with
/// [`CryptoError::NoKey`] until [`set_master_key`](Self::set_master_key)
/// or [`set_master_key_from_password`](Self::set_master_key_from_password)
/// is called.
#[derive(Default)]
pub struct CryptoEngine {
    key: RwLock<Option<MasterKey>>,
}

impl CryptoEngine {
    /// Creates an engine with no key loaded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine that already holds `key`.
    #[must_use]
    pub fn with_key(key: MasterKey) -> Self {
        Self {
            key: RwLock::new(Some(key)),
        }
    }

    /// Installs a master key, overwriting and replacing any previous one.
    pub fn set_master_key(&self, key: MasterKey) {
        let mut guard = self.key.write();
        if let Some(old) = guard.as_mut() {
            old.zeroize();
        }
        *guard = Some(key);
    }

    /// Derives the master key from a password and a stored salt.
    pub fn set_master_key_from_password(&self, password: &str, salt: &[u8]) {
        self.set_master_key(derive_key(password.as_bytes(), salt));
    }

    /// Returns true if a master key is loaded.
    pub fn has_key(&self) -> bool {
        self.key.read().is_some()
    }

    /// Overwrites the key bytes in memory and forgets the key.
    pub fn clear_key(&self) {
        let mut guard = self.key.write();
        if let Some(mut key) = guard.take() {
            key.zeroize();
        }
    }

    /// Fingerprint of the loaded key, if any.
    pub fn key_fingerprint(&self) -> CryptoResult<Option<String>> {
        self.key.read().as_ref().map(MasterKey::fingerprint).transpose()
    }

    /// Hashes a payload. Same as [`content_hash`].
    pub fn content_hash(&self, data: &[u8]) -> String {
        content_hash(data)
    }

    /// Encrypts bytes with the master key.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<EncryptedPayload> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(CryptoError::NoKey)?;
        seal(key, plaintext, None)
    }

    /// Decrypts an envelope produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Fails with [`CryptoError::DecryptionFailed`] if the key is wrong or
    /// the data was modified.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> CryptoResult<Vec<u8>> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(CryptoError::NoKey)?;
        open(key, payload)
    }

    /// Encrypts a UTF-8 payload and returns the JSON envelope text.
    pub fn encrypt_string(&self, plaintext: &str) -> CryptoResult<String> {
        self.encrypt(plaintext.as_bytes())?.to_json()
    }

    /// Decrypts a JSON envelope back into a UTF-8 payload.
    pub fn decrypt_string(&self, envelope: &str) -> CryptoResult<String> {
        let payload = EncryptedPayload::from_json(envelope)?;
        let bytes = self.decrypt(&payload)?;
        String::from_utf8(bytes)
            .map_err(|_| CryptoError::DecryptionFailed("plaintext is not UTF-8".into()))
    }

    /// Encrypts with a key derived from `password` and a fresh salt.
    ///
    /// Does not need or touch the master key.
    pub fn encrypt_with_password(
        &self,
        plaintext: &[u8],
        password: &str,
    ) -> CryptoResult<EncryptedPayload> {
        let salt = generate_salt();
        let key = derive_key(password.as_bytes(), &salt);
        seal(&key, plaintext, Some(&salt))
    }

    /// Decrypts an envelope produced by
    /// [`encrypt_with_password`](Self::encrypt_with_password).
    pub fn decrypt_with_password(
        &self,
        payload: &EncryptedPayload,
        password: &str,
    ) -> CryptoResult<Vec<u8>> {
        let salt = payload
            .salt
            .as_deref()
            .ok_or_else(|| CryptoError::malformed("missing salt"))?;
        let salt = EncryptedPayload::decode_field("salt", salt)?;
        let key = derive_key(password.as_bytes(), &salt);
        open(&key, payload)
    }

    /// Checks whether `password` with `salt` derives a key whose
    /// fingerprint equals `expected_fingerprint`.
    pub fn verify_password(&self, password: &str, salt: &[u8], expected_fingerprint: &str) -> bool {
        derive_key(password.as_bytes(), salt)
            .fingerprint()
            .map(|fp| fp == expected_fingerprint)
            .unwrap_or(false)
    }

    /// Exports the master key wrapped under `password`.
    pub fn export_key(&self, password: &str) -> CryptoResult<String> {
        let encoded = {
            let guard = self.key.read();
            guard.as_ref().ok_or(CryptoError::NoKey)?.to_base64()
        };
        let mut encoded = encoded.into_bytes();
        let wrapped = self.encrypt_with_password(&encoded, password);
        encoded.zeroize();
        wrapped?.to_json()
    }

    /// Imports a key exported by [`export_key`](Self::export_key) and
    /// installs it as the master key.
    pub fn import_key(&self, blob: &str, password: &str) -> CryptoResult<()> {
        let payload = EncryptedPayload::from_json(blob)?;
        let mut raw = self.decrypt_with_password(&payload, password)?;
        let key = std::str::from_utf8(&raw)
            .map_err(|_| CryptoError::malformed("exported key is not UTF-8"))
            .and_then(MasterKey::from_base64);
        raw.zeroize();
        self.set_master_key(key?);
        Ok(())
    }
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("has_key", &self.has_key())
            .finish()
    }
}

fn cipher_for(key: &MasterKey) -> Aes256Gcm {
    Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()))
}

fn seal(key: &MasterKey, plaintext: &[u8], salt: Option<&[u8]>) -> CryptoResult<EncryptedPayload> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the tag to the ciphertext
    let mut sealed = cipher_for(key)
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(EncryptedPayload {
        ciphertext: STANDARD.encode(&sealed),
        iv: STANDARD.encode(nonce_bytes),
        auth_tag: STANDARD.encode(tag),
        salt: salt.map(|s| STANDARD.encode(s)),
    })
}

fn open(key: &MasterKey, payload: &EncryptedPayload) -> CryptoResult<Vec<u8>> {
    let iv = EncryptedPayload::decode_field("iv", &payload.iv)?;
    let tag = EncryptedPayload::decode_field("authTag", &payload.auth_tag)?;
    let mut sealed = EncryptedPayload::decode_field("ciphertext", &payload.ciphertext)?;

    if iv.len() != NONCE_SIZE {
        return Err(CryptoError::malformed(format!("iv must be {NONCE_SIZE} bytes")));
    }
    if tag.len() != TAG_SIZE {
        return Err(CryptoError::malformed(format!("tag must be {TAG_SIZE} bytes")));
    }

    sealed.extend_from_slice(&tag);
    cipher_for(key)
        .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed("authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed() -> CryptoEngine {
        CryptoEngine::with_key(MasterKey::generate())
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let engine = keyed();
        let sealed = engine.encrypt(b"Hello, kbsync!").unwrap();
        assert_eq!(engine.decrypt(&sealed).unwrap(), b"Hello, kbsync!");
    }

    #[test]
    fn envelope_fields_have_expected_sizes() {
        let engine = keyed();
        let sealed = engine.encrypt(b"abc").unwrap();
        assert_eq!(STANDARD.decode(&sealed.iv).unwrap().len(), NONCE_SIZE);
        assert_eq!(STANDARD.decode(&sealed.auth_tag).unwrap().len(), TAG_SIZE);
        assert_eq!(STANDARD.decode(&sealed.ciphertext).unwrap().len(), 3);
        assert!(sealed.salt.is_none());

        let json = sealed.to_json().unwrap();
        assert!(json.contains("\"authTag\""));
        assert!(!json.contains("salt"));
    }

    #[test]
    fn same_plaintext_gives_different_ciphertext() {
        let engine = keyed();
        let a = engine.encrypt(b"same").unwrap();
        let b = engine.encrypt(b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let a = keyed();
        let b = keyed();
        let sealed = a.encrypt(b"secret").unwrap();
        assert!(matches!(
            b.decrypt(&sealed),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn tampered_tag_fails() {
        let engine = keyed();
        let mut sealed = engine.encrypt(b"data").unwrap();
        let mut tag = STANDARD.decode(&sealed.auth_tag).unwrap();
        tag[0] ^= 0xFF;
        sealed.auth_tag = STANDARD.encode(tag);
        assert!(engine.decrypt(&sealed).is_err());
    }

    #[test]
    fn string_helpers_roundtrip() {
        let engine = keyed();
        let envelope = engine.encrypt_string(r#"{"title":"Groceries"}"#).unwrap();
        assert!(!envelope.contains("Groceries"));
        assert_eq!(
            engine.decrypt_string(&envelope).unwrap(),
            r#"{"title":"Groceries"}"#
        );
    }

    #[test]
    fn no_key_is_reported() {
        let engine = CryptoEngine::new();
        assert!(!engine.has_key());
        assert!(matches!(engine.encrypt(b"x"), Err(CryptoError::NoKey)));
        assert!(engine.key_fingerprint().unwrap().is_none());
    }

    #[test]
    fn clear_key_forgets_key() {
        let engine = keyed();
        assert!(engine.has_key());
        engine.clear_key();
        assert!(!engine.has_key());
        assert!(matches!(engine.encrypt(b"x"), Err(CryptoError::NoKey)));
    }

    #[test]
    fn password_envelope_carries_salt() {
        let engine = CryptoEngine::new();
        let sealed = engine.encrypt_with_password(b"note", "pw").unwrap();
        assert!(sealed.salt.is_some());
        assert_eq!(engine.decrypt_with_password(&sealed, "pw").unwrap(), b"note");
        assert!(engine.decrypt_with_password(&sealed, "other").is_err());
    }

    #[test]
    fn verify_password_against_fingerprint() {
        let engine = CryptoEngine::new();
        let salt = generate_salt();
        engine.set_master_key_from_password("correct horse", &salt);
        let fp = engine.key_fingerprint().unwrap().unwrap();

        assert!(engine.verify_password("correct horse", &salt, &fp));
        assert!(!engine.verify_password("battery staple", &salt, &fp));
    }

    #[test]
    fn export_import_moves_key_between_engines() {
        let source = keyed();
        let blob = source.export_key("transfer").unwrap();

        let target = CryptoEngine::new();
        assert!(target.import_key(&blob, "wrong").is_err());
        assert!(!target.has_key());

        target.import_key(&blob, "transfer").unwrap();
        assert_eq!(
            source.key_fingerprint().unwrap(),
            target.key_fingerprint().unwrap()
        );
        let sealed = source.encrypt(b"shared").unwrap();
        assert_eq!(target.decrypt(&sealed).unwrap(), b"shared");
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_hash(b"abc").len(), 64);
    }

    #[test]
    fn debug_does_not_leak() {
        let engine = keyed();
        assert_eq!(format!("{engine:?}"), "CryptoEngine { has_key: true }");
    }
}
