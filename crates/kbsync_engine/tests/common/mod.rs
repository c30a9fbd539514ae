//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use kbsync_crypto::CryptoEngine;
use kbsync_engine::{
    HttpRequest, HttpResponse, LocalStore, LoopbackClient, LoopbackServer, MemoryDavServer,
    MemoryStore, ServerAdapter, ServerAdapterConfig, StorageAdapter, SyncConfig, SyncEngine,
    WebDavAdapter, WebDavConfig,
};
use kbsync_protocol::{Item, SyncStatus};
use kbsync_server::SyncServer;
use std::sync::Arc;

/// Routes loopback requests into a reference server.
pub struct RestBackend(pub SyncServer);

impl LoopbackServer for RestBackend {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        let response = self
            .0
            .handle(request.method.as_str(), request.path(), &headers, &request.body);
        HttpResponse::new(response.status, response.body)
    }
}

/// A device: its local store, its key holder and its engine.
pub struct Device {
    pub store: Arc<MemoryStore>,
    pub crypto: Arc<CryptoEngine>,
    pub engine: SyncEngine,
}

impl Device {
    pub fn new(adapter: Arc<dyn StorageAdapter>, config: SyncConfig) -> Self {
        Self::with_crypto(adapter, config, CryptoEngine::new())
    }

    pub fn with_crypto(
        adapter: Arc<dyn StorageAdapter>,
        config: SyncConfig,
        crypto: CryptoEngine,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let crypto = Arc::new(crypto);
        let engine = SyncEngine::new(config, adapter, store.clone(), crypto.clone());
        Self {
            store,
            crypto,
            engine,
        }
    }

    /// Creates a local note and returns its id.
    pub fn note(&self, title: &str) -> String {
        let payload = format!(r#"{{"title":"{title}"}}"#);
        self.store.create("note", &payload).unwrap().id
    }

    pub fn payload(&self, id: &str) -> Option<String> {
        self.store.get_by_id(id).unwrap().map(|item| item.payload)
    }

    pub fn item(&self, id: &str) -> Item {
        self.store.get_by_id(id).unwrap().unwrap()
    }

    /// Runs a session and asserts it succeeded.
    pub fn sync_ok(&self) -> kbsync_engine::SyncCycleResult {
        let result = self.engine.sync();
        assert!(result.success, "sync failed: {:?}", result.errors);
        result
    }

    pub fn live_items(&self) -> Vec<Item> {
        self.store
            .snapshot()
            .into_iter()
            .filter(|item| !item.is_deleted())
            .collect()
    }

    pub fn all_clean(&self) -> bool {
        self.store
            .snapshot()
            .iter()
            .all(|item| item.sync_status == SyncStatus::Clean)
    }
}

pub fn webdav_adapter(server: &Arc<MemoryDavServer>) -> Arc<dyn StorageAdapter> {
    let config = WebDavConfig::new("http://dav.local/remote.php/dav").with_credentials("alice", "pw");
    Arc::new(WebDavAdapter::new(config, LoopbackClient::new(server.clone())))
}

pub fn rest_adapter(server: &Arc<RestBackend>) -> Arc<dyn StorageAdapter> {
    let config = ServerAdapterConfig::new("http://sync.local");
    Arc::new(ServerAdapter::new(config, LoopbackClient::new(server.clone())))
}
