//! WebDAV storage adapter.
//!
//! Remote layout under the configured base path:
//!
//! ```text
//! workspace.json            remote metadata
//! items/{id}.json           full items
//! resources/{id}{ext}       binary attachments
//! changes/{ts:016}-{r}.json change log, one file per change
//! cursors/{device}.json     per-device change-log position
//! locks/lock.json           lease lock
//! ```
//!
//! Change files are named so that lexical order is chronological order,
//! which makes the file name itself the cursor.

use crate::adapter::{sentinel, StorageAdapter};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kbsync_protocol::{
    now_millis, ChangePage, ChangeRecord, Item, Lock, LockStatus, RemoteMeta, SyncCursor,
    SyncStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const META_FILE: &str = "workspace.json";
const ITEMS_DIR: &str = "items";
const RESOURCES_DIR: &str = "resources";
const CHANGES_DIR: &str = "changes";
const CURSORS_DIR: &str = "cursors";
const LOCKS_DIR: &str = "locks";
const LOCK_FILE: &str = "locks/lock.json";

const COLLECTIONS: [&str; 5] = [ITEMS_DIR, RESOURCES_DIR, CHANGES_DIR, CURSORS_DIR, LOCKS_DIR];

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

/// File extension used for a resource of the given MIME type.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "application/pdf" => ".pdf",
        _ => "",
    }
}

/// Connection settings for a WebDAV backend.
#[derive(Clone, PartialEq, Eq)]
pub struct WebDavConfig {
    /// Server root URL.
    pub url: String,
    /// Basic auth user. Empty disables auth.
    pub username: String,
    /// Basic auth password.
    pub password: String,
    /// Directory holding the sync tree, relative to `url`.
    pub base_path: String,
}

impl WebDavConfig {
    /// Base path used when none is configured.
    pub const DEFAULT_BASE_PATH: &'static str = "/kbsync";

    /// Creates a configuration without credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: String::new(),
            password: String::new(),
            base_path: Self::DEFAULT_BASE_PATH.to_string(),
        }
    }

    /// Sets Basic auth credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets the base path.
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    fn authorization(&self) -> Option<String> {
        if self.username.is_empty() {
            return None;
        }
        let credentials = format!("{}:{}", self.username, self.password);
        Some(format!("Basic {}", BASE64.encode(credentials)))
    }

    fn base_segments(&self) -> Vec<&str> {
        self.base_path.split('/').filter(|s| !s.is_empty()).collect()
    }
}

impl fmt::Debug for WebDavConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebDavConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// One entry of a PROPFIND listing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DavEntry {
    name: String,
    is_collection: bool,
}

/// [`StorageAdapter`] over a plain WebDAV file tree.
pub struct WebDavAdapter<C: HttpClient> {
    config: WebDavConfig,
    client: C,
    root: String,
    authorization: Option<String>,
}

impl<C: HttpClient> WebDavAdapter<C> {
    /// Creates an adapter. No request is made until the first call.
    pub fn new(config: WebDavConfig, client: C) -> Self {
        let mut root = config.url.trim_end_matches('/').to_string();
        for segment in config.base_segments() {
            root.push('/');
            root.push_str(&urlencoding::encode(segment));
        }
        let authorization = config.authorization();
        Self {
            config,
            client,
            root,
            authorization,
        }
    }

    /// The connection settings.
    pub fn config(&self) -> &WebDavConfig {
        &self.config
    }

    fn url(&self, relative: &str) -> String {
        if relative.is_empty() {
            format!("{}/", self.root)
        } else {
            format!("{}/{}", self.root, relative)
        }
    }

    fn send(&self, method: Method, url: String, body: Vec<u8>) -> SyncResult<HttpResponse> {
        let mut request = HttpRequest::new(method, url).body(body);
        if let Some(auth) = &self.authorization {
            request = request.header("Authorization", auth.as_str());
        }
        if method == Method::Propfind {
            request = request
                .header("Depth", "1")
                .header("Content-Type", "application/xml; charset=utf-8");
        }
        self.client.execute(request)
    }

    fn get_bytes(&self, relative: &str) -> SyncResult<Option<Vec<u8>>> {
        let response = self.send(Method::Get, self.url(relative), Vec::new())?;
        if response.status == 404 {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.body))
    }

    fn get_json<T: DeserializeOwned>(&self, relative: &str) -> SyncResult<Option<T>> {
        match self.get_bytes(relative)? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    fn put_bytes(&self, relative: &str, body: Vec<u8>) -> SyncResult<()> {
        self.send(Method::Put, self.url(relative), body)?
            .error_for_status()?;
        Ok(())
    }

    fn put_json<T: Serialize>(&self, relative: &str, value: &T) -> SyncResult<()> {
        self.put_bytes(relative, serde_json::to_vec_pretty(value)?)
    }

    /// Deletes a file. Returns false if it did not exist.
    fn delete(&self, relative: &str) -> SyncResult<bool> {
        let response = self.send(Method::Delete, self.url(relative), Vec::new())?;
        if response.status == 404 {
            return Ok(false);
        }
        response.error_for_status()?;
        Ok(true)
    }

    /// Creates a collection. An existing collection is not an error.
    fn mkcol(&self, url: String) -> SyncResult<()> {
        let response = self.send(Method::Mkcol, url, Vec::new())?;
        match response.status {
            405 => Ok(()),
            _ => response.error_for_status().map(|_| ()),
        }
    }

    /// Lists the direct children of a collection. A missing collection
    /// lists as empty.
    fn list(&self, collection: &str) -> SyncResult<Vec<DavEntry>> {
        let url = self.url(&format!("{collection}/"));
        let response = self.send(Method::Propfind, url, PROPFIND_BODY.as_bytes().to_vec())?;
        if response.status == 404 {
            return Ok(Vec::new());
        }
        let response = response.error_for_status()?;
        let entries = parse_multistatus(&response.text())?;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_collection && !entry.name.is_empty())
            .collect())
    }

    fn list_json_names(&self, collection: &str) -> SyncResult<Vec<String>> {
        let mut names: Vec<String> = self
            .list(collection)?
            .into_iter()
            .map(|entry| entry.name)
            .filter(|name| name.ends_with(".json"))
            .collect();
        names.sort();
        Ok(names)
    }

    fn item_path(id: &str) -> String {
        format!("{ITEMS_DIR}/{}.json", urlencoding::encode(id))
    }

    fn cursor_path(device_id: &str) -> String {
        format!("{CURSORS_DIR}/{}.json", urlencoding::encode(device_id))
    }

    fn find_resource(&self, id: &str) -> SyncResult<Option<String>> {
        Ok(self
            .list(RESOURCES_DIR)?
            .into_iter()
            .map(|entry| entry.name)
            .find(|name| resource_stem(name) == id))
    }

    fn prepare(&self) -> SyncResult<()> {
        let segments = self.config.base_segments();
        let mut url = self.config.url.trim_end_matches('/').to_string();
        for (index, segment) in segments.iter().enumerate() {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
            let result = self.mkcol(format!("{url}/"));
            // Parents of the base path may be read-only mount points.
            if index + 1 < segments.len() {
                if let Err(e) = result {
                    debug!(segment = %segment, error = %e, "could not create parent collection");
                }
            } else {
                result?;
            }
        }
        for collection in COLLECTIONS {
            self.mkcol(self.url(&format!("{collection}/")))?;
        }
        Ok(())
    }

    fn store_item(&self, item: &Item) -> SyncResult<String> {
        // The change id doubles as the revision.
        let change_id = new_change_id(now_millis());
        let rev = change_id.clone();

        let mut stored = item.clone();
        stored.remote_rev = Some(rev.clone());
        stored.sync_status = SyncStatus::Clean;
        self.put_json(&Self::item_path(&item.id), &stored)?;

        let record = stored.to_change_record(change_id.clone());
        self.put_json(&format!("{CHANGES_DIR}/{change_id}.json"), &record)?;
        debug!(item_id = %item.id, change_id, "stored item");
        Ok(rev)
    }

    fn read_changes(&self, cursor: Option<&str>, limit: usize) -> SyncResult<ChangePage> {
        let names = self.list_json_names(CHANGES_DIR)?;
        let after: Vec<&String> = names
            .iter()
            .filter(|name| cursor.map_or(true, |cur| change_stem(name) > cur))
            .collect();
        if after.is_empty() {
            return Ok(ChangePage::empty());
        }

        let window = &after[..limit.min(after.len())];
        let mut changes = Vec::with_capacity(window.len());
        let mut handled: Option<&String> = None;
        for name in window {
            let body = match self.get_bytes(&format!("{CHANGES_DIR}/{name}")) {
                Ok(body) => body,
                // The page ends before a change that could not be fetched so
                // the cursor never moves past it.
                Err(e) if handled.is_none() => return Err(e),
                Err(e) => {
                    warn!(name = %name, error = %e, "change fetch failed, ending page early");
                    return Ok(ChangePage {
                        changes,
                        next_cursor: handled.map(|name| change_stem(name).to_string()),
                        has_more: true,
                    });
                }
            };
            match body.map(|body| serde_json::from_slice::<ChangeRecord>(&body)) {
                Some(Ok(mut change)) => {
                    change.change_id = change_stem(name).to_string();
                    changes.push(change);
                }
                Some(Err(e)) => warn!(name = %name, error = %e, "skipping unreadable change file"),
                // Pruned between listing and fetching.
                None => debug!(name = %name, "change file vanished"),
            }
            handled = Some(*name);
        }

        Ok(ChangePage {
            changes,
            next_cursor: window.last().map(|name| change_stem(name).to_string()),
            has_more: after.len() > window.len(),
        })
    }

    fn read_lock(&self) -> SyncResult<Option<Lock>> {
        self.get_json(LOCK_FILE)
    }

    fn take_lock(&self, device_id: &str, lease: Duration) -> SyncResult<bool> {
        let now = now_millis();
        if let Some(existing) = self.read_lock()? {
            if !existing.is_reclaimable_by(device_id, now) {
                debug!(owner = %existing.owner, "lock held by another device");
                return Ok(false);
            }
        }
        let lock = Lock::new(device_id, now, lease.as_millis() as i64);
        self.put_json(LOCK_FILE, &lock)?;
        Ok(true)
    }

    fn drop_lock(&self, device_id: &str) -> SyncResult<bool> {
        match self.read_lock()? {
            Some(lock) if lock.owner != device_id => Ok(false),
            Some(_) => {
                self.delete(LOCK_FILE)?;
                Ok(true)
            }
            None => Ok(true),
        }
    }

    fn remove_changes_before(&self, before: i64) -> SyncResult<usize> {
        let mut removed = 0;
        for name in self.list_json_names(CHANGES_DIR)? {
            let Some(ts) = change_timestamp(&name) else {
                continue;
            };
            if ts >= before {
                continue;
            }
            match self.delete(&format!("{CHANGES_DIR}/{name}")) {
                Ok(_) => removed += 1,
                Err(e) => warn!(name = %name, error = %e, "failed to delete change file"),
            }
        }
        info!(removed, "pruned change log");
        Ok(removed)
    }
}

impl<C: HttpClient> StorageAdapter for WebDavAdapter<C> {
    fn kind(&self) -> &'static str {
        "webdav"
    }

    fn test_connection(&self) -> bool {
        sentinel(self.kind(), "test_connection", self.prepare()).is_some()
    }

    fn get_remote_meta(&self) -> Option<RemoteMeta> {
        sentinel(
            self.kind(),
            "get_remote_meta",
            self.get_json::<RemoteMeta>(META_FILE),
        )
        .map(Option::unwrap_or_default)
    }

    fn put_remote_meta(&self, meta: &RemoteMeta) -> bool {
        sentinel(self.kind(), "put_remote_meta", self.put_json(META_FILE, meta)).is_some()
    }

    fn list_changes(&self, cursor: Option<&str>, limit: usize) -> Option<ChangePage> {
        sentinel(self.kind(), "list_changes", self.read_changes(cursor, limit.max(1)))
    }

    fn get_item(&self, id: &str) -> Option<Item> {
        sentinel(self.kind(), "get_item", self.get_json(&Self::item_path(id))).flatten()
    }

    fn put_item(&self, item: &Item) -> Option<String> {
        sentinel(self.kind(), "put_item", self.store_item(item))
    }

    fn delete_item(&self, id: &str) -> bool {
        sentinel(self.kind(), "delete_item", self.delete(&Self::item_path(id))).is_some()
    }

    fn get_resource(&self, id: &str) -> Option<Vec<u8>> {
        let lookup = self.find_resource(id).and_then(|name| match name {
            Some(name) => self.get_bytes(&format!("{RESOURCES_DIR}/{name}")),
            None => Ok(None),
        });
        sentinel(self.kind(), "get_resource", lookup).flatten()
    }

    fn put_resource(&self, id: &str, data: &[u8], mime_type: &str) -> bool {
        let path = format!(
            "{RESOURCES_DIR}/{}{}",
            urlencoding::encode(id),
            extension_for_mime(mime_type)
        );
        sentinel(self.kind(), "put_resource", self.put_bytes(&path, data.to_vec())).is_some()
    }

    fn delete_resource(&self, id: &str) -> bool {
        let removal = self.find_resource(id).and_then(|name| match name {
            Some(name) => self.delete(&format!("{RESOURCES_DIR}/{name}")),
            None => Ok(false),
        });
        sentinel(self.kind(), "delete_resource", removal).is_some()
    }

    fn get_sync_cursor(&self, device_id: &str) -> Option<SyncCursor> {
        sentinel(
            self.kind(),
            "get_sync_cursor",
            self.get_json(&Self::cursor_path(device_id)),
        )
        .flatten()
    }

    fn set_sync_cursor(&self, device_id: &str, cursor: &SyncCursor) -> bool {
        sentinel(
            self.kind(),
            "set_sync_cursor",
            self.put_json(&Self::cursor_path(device_id), cursor),
        )
        .is_some()
    }

    fn acquire_lock(&self, device_id: &str, lease: Duration) -> bool {
        sentinel(self.kind(), "acquire_lock", self.take_lock(device_id, lease)).unwrap_or(false)
    }

    fn release_lock(&self, device_id: &str) -> bool {
        sentinel(self.kind(), "release_lock", self.drop_lock(device_id)).unwrap_or(false)
    }

    fn check_lock(&self) -> Option<LockStatus> {
        sentinel(self.kind(), "check_lock", self.read_lock()).map(|lock| {
            lock.map(|lock| lock.status_at(now_millis()))
                .unwrap_or_default()
        })
    }

    fn has_existing_data(&self) -> bool {
        match self.list_json_names(ITEMS_DIR) {
            Ok(names) => !names.is_empty(),
            Err(e) => {
                warn!(error = %e, "could not list items, falling back to metadata");
                self.get_remote_meta()
                    .and_then(|meta| meta.last_sync_time)
                    .is_some()
            }
        }
    }

    fn prune_changes(&self, before: i64) -> usize {
        sentinel(self.kind(), "prune_changes", self.remove_changes_before(before)).unwrap_or(0)
    }
}

/// Last timestamp handed out by [`new_change_id`] in this process.
static LAST_CHANGE_TIME: AtomicI64 = AtomicI64::new(0);

/// Name of a new change file (without extension) for a write at `now`.
///
/// Timestamps are strictly increasing within one process, so a device
/// never orders its own writes behind each other.
fn new_change_id(now: i64) -> String {
    let previous = LAST_CHANGE_TIME
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    let stamp = now.max(previous + 1).max(0);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{stamp:016}-{}", &suffix[..8])
}

fn change_stem(name: &str) -> &str {
    name.strip_suffix(".json").unwrap_or(name)
}

fn change_timestamp(name: &str) -> Option<i64> {
    name.get(..16)?.parse().ok()
}

fn resource_stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

/// Extracts entries from a PROPFIND multistatus body.
///
/// Scans tags by local name, so any namespace prefix is accepted.
fn parse_multistatus(xml: &str) -> SyncResult<Vec<DavEntry>> {
    let mut entries = Vec::new();
    let mut in_response = false;
    let mut href: Option<String> = None;
    let mut is_collection = false;
    let mut rest = xml;

    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let close = after
            .find('>')
            .ok_or_else(|| SyncError::Protocol("unterminated tag in PROPFIND response".into()))?;
        let tag = &after[..close];
        rest = &after[close + 1..];

        if tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        let (closing, tag) = match tag.strip_prefix('/') {
            Some(name) => (true, name),
            None => (false, tag),
        };
        let self_closing = tag.ends_with('/');
        let name = tag
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or_default();
        let local = name.rsplit(':').next().unwrap_or(name);

        match (local, closing) {
            ("response", false) if !self_closing => {
                in_response = true;
                href = None;
                is_collection = false;
            }
            ("href", false) if in_response && !self_closing => {
                let end = rest.find('<').ok_or_else(|| {
                    SyncError::Protocol("unterminated href in PROPFIND response".into())
                })?;
                href = Some(unescape_xml(rest[..end].trim()));
                rest = &rest[end..];
            }
            ("collection", false) => is_collection = true,
            ("response", true) => {
                if !in_response {
                    return Err(SyncError::Protocol("unbalanced PROPFIND response".into()));
                }
                in_response = false;
                if let Some(raw) = href.take() {
                    let is_collection = is_collection || raw.ends_with('/');
                    entries.push(DavEntry {
                        name: href_basename(&raw),
                        is_collection,
                    });
                }
            }
            _ => {}
        }
    }

    if in_response {
        return Err(SyncError::Protocol("unterminated PROPFIND response".into()));
    }
    Ok(entries)
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn href_basename(href: &str) -> String {
    let trimmed = href.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    urlencoding::decode(last)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| last.to_string())
}
