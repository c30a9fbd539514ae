//! Attachment upload and download.

use crate::adapter::StorageAdapter;
use crate::error::{SyncError, SyncResult};
use kbsync_crypto::{content_hash, CryptoEngine, EncryptedPayload};
use std::sync::Arc;
use tracing::debug;

/// Moves binary attachments between the local side and a backend.
///
/// Every transfer is checked against the SHA-256 of the plaintext bytes.
/// With a crypto engine attached, bytes are sealed before upload and
/// opened after download.
pub struct ResourceTransfer {
    adapter: Arc<dyn StorageAdapter>,
    crypto: Option<Arc<CryptoEngine>>,
}

impl ResourceTransfer {
    /// Creates a plaintext transfer helper.
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            crypto: None,
        }
    }

    /// Encrypts attachments with `crypto`.
    pub fn with_crypto(mut self, crypto: Arc<CryptoEngine>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Uploads `data` and returns its plaintext hash.
    pub fn upload(&self, id: &str, data: &[u8], mime_type: &str) -> SyncResult<String> {
        let hash = content_hash(data);
        let body = match &self.crypto {
            Some(crypto) => crypto.encrypt(data)?.to_json()?.into_bytes(),
            None => data.to_vec(),
        };
        if !self.adapter.put_resource(id, &body, mime_type) {
            return Err(SyncError::transport_retryable(format!(
                "upload of resource {id} failed"
            )));
        }
        debug!(resource_id = id, bytes = data.len(), "uploaded resource");
        Ok(hash)
    }

    /// Downloads a resource and verifies it against `expected_hash`.
    pub fn download(&self, id: &str, expected_hash: &str) -> SyncResult<Vec<u8>> {
        let body = self
            .adapter
            .get_resource(id)
            .ok_or_else(|| SyncError::ItemNotFound(format!("resource {id}")))?;

        let data = match &self.crypto {
            Some(crypto) => {
                let text = std::str::from_utf8(&body)
                    .map_err(|_| SyncError::Protocol(format!("resource {id} is not sealed")))?;
                crypto.decrypt(&EncryptedPayload::from_json(text)?)?
            }
            None => body,
        };

        let actual = content_hash(&data);
        if actual != expected_hash {
            return Err(SyncError::Protocol(format!(
                "resource {id} hash mismatch: expected {expected_hash}, got {actual}"
            )));
        }
        Ok(data)
    }

    /// Deletes a resource from the backend.
    pub fn remove(&self, id: &str) -> bool {
        self.adapter.delete_resource(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use kbsync_crypto::MasterKey;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake image";

    #[test]
    fn plaintext_round_trip_with_verification() {
        let adapter = Arc::new(MemoryAdapter::new());
        let transfer = ResourceTransfer::new(adapter.clone());

        let hash = transfer.upload("img", PNG, "image/png").unwrap();
        assert_eq!(transfer.download("img", &hash).unwrap(), PNG);
        assert!(matches!(
            transfer.download("img", "0000"),
            Err(SyncError::Protocol(_))
        ));
        assert!(transfer.remove("img"));
        assert!(matches!(
            transfer.download("img", &hash),
            Err(SyncError::ItemNotFound(_))
        ));
    }

    #[test]
    fn encrypted_resources_are_opaque_remotely() {
        let adapter = Arc::new(MemoryAdapter::new());
        let crypto = Arc::new(CryptoEngine::with_key(MasterKey::generate()));
        let transfer = ResourceTransfer::new(adapter.clone()).with_crypto(crypto);

        let hash = transfer.upload("doc", PNG, "application/pdf").unwrap();
        let stored = adapter.get_resource("doc").unwrap();
        assert!(!stored.windows(4).any(|w| w == b"fake"));
        assert_eq!(transfer.download("doc", &hash).unwrap(), PNG);

        let other = ResourceTransfer::new(adapter)
            .with_crypto(Arc::new(CryptoEngine::with_key(MasterKey::generate())));
        assert!(matches!(
            other.download("doc", &hash),
            Err(SyncError::Crypto(_))
        ));
    }

    #[test]
    fn offline_upload_is_retryable() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.set_offline(true);
        let err = ResourceTransfer::new(adapter)
            .upload("x", b"1", "image/gif")
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
