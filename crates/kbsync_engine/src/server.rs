//! REST storage adapter for a kbsync server.

use crate::adapter::{sentinel, StorageAdapter};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use kbsync_protocol::{
    BatchPutRequest, BatchPutResponse, BatchPutResult, ChangePage, HealthResponse, Item,
    LockRequest, LockResponse, LockStatus, PutItemResponse, PutOutcome, ReleaseLockRequest,
    RemoteMeta, ServerStatus, SyncCursor,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Connection settings for a kbsync server.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerAdapterConfig {
    /// Server root URL.
    pub url: String,
    /// Static API key, sent as `X-API-Key`.
    pub api_key: Option<String>,
    /// Bearer token, sent as `Authorization`.
    pub token: Option<String>,
}

impl ServerAdapterConfig {
    /// Creates an unauthenticated configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            token: None,
        }
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl fmt::Debug for ServerAdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerAdapterConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// [`StorageAdapter`] over the kbsync REST API.
pub struct ServerAdapter<C: HttpClient> {
    config: ServerAdapterConfig,
    client: C,
    base: String,
}

impl<C: HttpClient> ServerAdapter<C> {
    /// Creates an adapter. No request is made until the first call.
    pub fn new(config: ServerAdapterConfig, client: C) -> Self {
        let base = config.url.trim_end_matches('/').to_string();
        Self {
            config,
            client,
            base,
        }
    }

    /// Fetches `/api/status`.
    pub fn server_status(&self) -> Option<ServerStatus> {
        sentinel(
            self.kind(),
            "server_status",
            self.call(Method::Get, "/api/status", None::<&()>),
        )
    }

    fn request(&self, method: Method, path: &str) -> HttpRequest {
        let mut request = HttpRequest::new(method, format!("{}{}", self.base, path));
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key.as_str());
        }
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        request
    }

    fn send<B: Serialize>(&self, method: Method, path: &str, body: Option<&B>) -> SyncResult<HttpResponse> {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request.json(body)?;
        }
        self.client.execute(request)
    }

    /// Sends a request and decodes a JSON reply.
    fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> SyncResult<T> {
        self.send(method, path, body)?.error_for_status()?.parse_json()
    }

    /// Like [`call`](Self::call), mapping 404 to `None`.
    fn call_optional<T: DeserializeOwned>(&self, path: &str) -> SyncResult<Option<T>> {
        let response = self.send(Method::Get, path, None::<&()>)?;
        if response.status == 404 {
            return Ok(None);
        }
        response.error_for_status()?.parse_json().map(Some)
    }

    /// Sends a request whose reply body is ignored.
    fn perform<B: Serialize>(&self, method: Method, path: &str, body: Option<&B>) -> SyncResult<()> {
        self.send(method, path, body)?.error_for_status()?;
        Ok(())
    }

    fn health(&self) -> SyncResult<()> {
        let health: HealthResponse = self.call(Method::Get, "/api/health", None::<&()>)?;
        if health.status != "ok" {
            return Err(SyncError::Protocol(format!(
                "server reports status {}",
                health.status
            )));
        }
        Ok(())
    }

    fn changes_path(cursor: Option<&str>, limit: usize) -> String {
        match cursor {
            Some(cursor) => format!(
                "/api/changes?cursor={}&limit={limit}",
                urlencoding::encode(cursor)
            ),
            None => format!("/api/changes?limit={limit}"),
        }
    }

    fn item_path(id: &str) -> String {
        format!("/api/items/{}", urlencoding::encode(id))
    }

    fn resource_path(id: &str) -> String {
        format!("/api/resources/{}", urlencoding::encode(id))
    }

    fn cursor_path(device_id: &str) -> String {
        format!("/api/sync/cursor?device={}", urlencoding::encode(device_id))
    }

    fn batch_put(&self, items: &[Item]) -> SyncResult<Vec<PutOutcome>> {
        let request = BatchPutRequest {
            items: items.to_vec(),
        };
        let response: BatchPutResponse =
            self.call(Method::Post, "/api/items/batch", Some(&request))?;
        // Results are matched by id; an item the reply does not mention
        // counts as failed.
        let mut results: HashMap<String, BatchPutResult> = response
            .results
            .into_iter()
            .map(|result| (result.id.clone(), result))
            .collect();
        Ok(items
            .iter()
            .map(|item| match results.remove(&item.id) {
                Some(BatchPutResult {
                    remote_rev: Some(rev),
                    error: None,
                    ..
                }) => PutOutcome::stored(&item.id, rev),
                Some(result) => PutOutcome::failed(
                    &item.id,
                    result.error.unwrap_or_else(|| "rejected by server".into()),
                ),
                None => PutOutcome::failed(&item.id, "missing from batch reply"),
            })
            .collect())
    }

    fn get_resource_bytes(&self, id: &str) -> SyncResult<Option<Vec<u8>>> {
        let response = self.send(Method::Get, &Self::resource_path(id), None::<&()>)?;
        if response.status == 404 {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.body))
    }

    fn put_resource_bytes(&self, id: &str, data: &[u8], mime_type: &str) -> SyncResult<()> {
        let request = self
            .request(Method::Put, &Self::resource_path(id))
            .header("Content-Type", mime_type)
            .body(data.to_vec());
        self.client.execute(request)?.error_for_status()?;
        Ok(())
    }

    fn release(&self, device_id: &str) -> SyncResult<bool> {
        let body = ReleaseLockRequest {
            device_id: device_id.to_string(),
        };
        let response = self.send(Method::Delete, "/api/sync/lock", Some(&body))?;
        if response.status == 409 {
            return Ok(false);
        }
        response.error_for_status()?;
        Ok(true)
    }
}

impl<C: HttpClient> StorageAdapter for ServerAdapter<C> {
    fn kind(&self) -> &'static str {
        "server"
    }

    fn test_connection(&self) -> bool {
        sentinel(self.kind(), "test_connection", self.health()).is_some()
    }

    fn get_remote_meta(&self) -> Option<RemoteMeta> {
        sentinel(
            self.kind(),
            "get_remote_meta",
            self.call_optional::<RemoteMeta>("/api/meta"),
        )
        .map(Option::unwrap_or_default)
    }

    fn put_remote_meta(&self, meta: &RemoteMeta) -> bool {
        sentinel(
            self.kind(),
            "put_remote_meta",
            self.perform(Method::Put, "/api/meta", Some(meta)),
        )
        .is_some()
    }

    fn list_changes(&self, cursor: Option<&str>, limit: usize) -> Option<ChangePage> {
        sentinel(
            self.kind(),
            "list_changes",
            self.call(
                Method::Get,
                &Self::changes_path(cursor, limit.max(1)),
                None::<&()>,
            ),
        )
    }

    fn get_item(&self, id: &str) -> Option<Item> {
        sentinel(self.kind(), "get_item", self.call_optional(&Self::item_path(id))).flatten()
    }

    fn put_item(&self, item: &Item) -> Option<String> {
        sentinel(
            self.kind(),
            "put_item",
            self.call::<_, PutItemResponse>(Method::Put, &Self::item_path(&item.id), Some(item)),
        )
        .map(|response| response.remote_rev)
    }

    fn put_items(&self, items: &[Item]) -> Vec<PutOutcome> {
        if items.is_empty() {
            return Vec::new();
        }
        match self.batch_put(items) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(error = %e, count = items.len(), "batch upload failed, uploading one by one");
                items
                    .iter()
                    .map(|item| match self.put_item(item) {
                        Some(rev) => PutOutcome::stored(&item.id, rev),
                        None => PutOutcome::failed(&item.id, "server upload failed"),
                    })
                    .collect()
            }
        }
    }

    fn delete_item(&self, id: &str) -> bool {
        sentinel(
            self.kind(),
            "delete_item",
            self.perform(Method::Delete, &Self::item_path(id), None::<&()>),
        )
        .is_some()
    }

    fn get_resource(&self, id: &str) -> Option<Vec<u8>> {
        sentinel(self.kind(), "get_resource", self.get_resource_bytes(id)).flatten()
    }

    fn put_resource(&self, id: &str, data: &[u8], mime_type: &str) -> bool {
        sentinel(
            self.kind(),
            "put_resource",
            self.put_resource_bytes(id, data, mime_type),
        )
        .is_some()
    }

    fn delete_resource(&self, id: &str) -> bool {
        sentinel(
            self.kind(),
            "delete_resource",
            self.perform(Method::Delete, &Self::resource_path(id), None::<&()>),
        )
        .is_some()
    }

    fn get_sync_cursor(&self, device_id: &str) -> Option<SyncCursor> {
        sentinel(
            self.kind(),
            "get_sync_cursor",
            self.call_optional(&Self::cursor_path(device_id)),
        )
        .flatten()
    }

    fn set_sync_cursor(&self, device_id: &str, cursor: &SyncCursor) -> bool {
        sentinel(
            self.kind(),
            "set_sync_cursor",
            self.perform(Method::Put, &Self::cursor_path(device_id), Some(cursor)),
        )
        .is_some()
    }

    fn acquire_lock(&self, device_id: &str, lease: Duration) -> bool {
        let request = LockRequest {
            device_id: device_id.to_string(),
            timeout: lease.as_millis() as i64,
        };
        let acquired = sentinel(
            self.kind(),
            "acquire_lock",
            self.call::<_, LockResponse>(Method::Post, "/api/sync/lock", Some(&request)),
        )
        .is_some_and(|response| response.acquired);
        debug!(device_id, acquired, "lock request");
        acquired
    }

    fn release_lock(&self, device_id: &str) -> bool {
        sentinel(self.kind(), "release_lock", self.release(device_id)).unwrap_or(false)
    }

    fn check_lock(&self) -> Option<LockStatus> {
        sentinel(
            self.kind(),
            "check_lock",
            self.call(Method::Get, "/api/sync/lock", None::<&()>),
        )
    }
}
