//! # kbsync Crypto
//!
//! End-to-end encryption primitives for the kbsync engine.
//!
//! This crate provides:
//! - AES-256-GCM authenticated encryption with a JSON envelope
//! - PBKDF2-HMAC-SHA256 password-derived keys
//! - SHA-256 content hashing for change detection
//! - Key fingerprints for cross-device mismatch detection
//!
//! Payload hashes are always taken over plaintext. Encrypting an item
//! never changes its `content_hash`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod key;

pub use engine::{content_hash, CryptoEngine, EncryptedPayload};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    derive_key, generate_salt, MasterKey, KEY_SIZE, NONCE_SIZE, PBKDF2_ITERATIONS, SALT_SIZE,
    TAG_SIZE,
};
