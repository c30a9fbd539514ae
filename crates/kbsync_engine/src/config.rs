//! Configuration for the sync engine and scheduler.
//!
//! [`SyncConfig`] and [`SchedulerConfig`] are the runtime structs the
//! engine and scheduler consume. [`SyncSettings`] is the persisted,
//! user-facing form they are built from.

use crate::adapter::StorageAdapter;
use crate::error::{SyncError, SyncResult};
use crate::http::ReqwestClient;
use crate::server::{ServerAdapter, ServerAdapterConfig};
use crate::webdav::{WebDavAdapter, WebDavConfig};
use kbsync_protocol::{ConflictPolicy, ModuleSet, SensitiveTypes};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for sync sessions.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this device.
    pub device_id: String,
    /// Encrypt every pushed payload.
    pub encryption_enabled: bool,
    /// Modules whose item types are replicated.
    pub modules: ModuleSet,
    /// Types encrypted even when global encryption is off.
    pub sensitive_types: SensitiveTypes,
    /// How conflicts are settled.
    pub conflict_policy: ConflictPolicy,
    /// Lease requested for the remote lock.
    pub lock_timeout: Duration,
    /// Changes requested per pull page.
    pub page_limit: usize,
    /// Upper bound on pages pulled in one session.
    pub max_pull_pages: usize,
    /// Items uploaded per push batch.
    pub push_batch_size: usize,
}

impl SyncConfig {
    /// Creates a configuration with defaults for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            encryption_enabled: false,
            modules: ModuleSet::all(),
            sensitive_types: SensitiveTypes::default(),
            conflict_policy: ConflictPolicy::default(),
            lock_timeout: Duration::from_secs(300),
            page_limit: 100,
            max_pull_pages: 1000,
            push_batch_size: 50,
        }
    }

    /// Enables or disables global encryption.
    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption_enabled = enabled;
        self
    }

    /// Sets the replicated modules.
    pub fn with_modules(mut self, modules: ModuleSet) -> Self {
        self.modules = modules;
        self
    }

    /// Sets the always-encrypted types.
    pub fn with_sensitive_types(mut self, types: SensitiveTypes) -> Self {
        self.sensitive_types = types;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the lock lease.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the pull page size.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    /// Sets the pull page cap.
    pub fn with_max_pull_pages(mut self, pages: usize) -> Self {
        self.max_pull_pages = pages.max(1);
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Returns true if items of `item_type` must be encrypted on push.
    pub fn must_encrypt(&self, item_type: &str) -> bool {
        self.encryption_enabled || self.sensitive_types.contains(item_type)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Run one session right after `start`.
    pub auto_sync_on_start: bool,
    /// Periodic interval. Zero disables periodic sync.
    pub sync_interval: Duration,
    /// Trigger a session after local edits settle.
    pub sync_on_change: bool,
    /// Quiet period after the last local edit.
    pub change_debounce: Duration,
}

impl SchedulerConfig {
    /// Sets the periodic interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the change debounce.
    pub fn with_change_debounce(mut self, debounce: Duration) -> Self {
        self.change_debounce = debounce;
        self
    }

    /// Enables or disables the start-up session.
    pub fn with_auto_sync_on_start(mut self, enabled: bool) -> Self {
        self.auto_sync_on_start = enabled;
        self
    }

    /// Enables or disables change-triggered sync.
    pub fn with_sync_on_change(mut self, enabled: bool) -> Self {
        self.sync_on_change = enabled;
        self
    }

    /// Periodic interval, unless disabled.
    pub fn interval(&self) -> Option<Duration> {
        (!self.sync_interval.is_zero()).then_some(self.sync_interval)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_sync_on_start: false,
            sync_interval: Duration::from_secs(5 * 60),
            sync_on_change: true,
            change_debounce: Duration::from_secs(30),
        }
    }
}

/// Backend connection settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSettings {
    /// A WebDAV server.
    Webdav {
        /// Server root URL.
        url: String,
        /// Basic auth user.
        #[serde(default)]
        username: String,
        /// Basic auth password.
        #[serde(default)]
        password: String,
        /// Directory holding the sync tree.
        #[serde(default = "default_base_path")]
        base_path: String,
    },
    /// A kbsync REST server.
    Server {
        /// Server root URL.
        url: String,
        /// Static API key.
        #[serde(default)]
        api_key: Option<String>,
        /// Bearer token.
        #[serde(default)]
        token: Option<String>,
    },
}

fn default_base_path() -> String {
    WebDavConfig::DEFAULT_BASE_PATH.to_string()
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSettings::Webdav {
                url,
                username,
                base_path,
                ..
            } => f
                .debug_struct("Webdav")
                .field("url", url)
                .field("username", username)
                .field("password", &"[REDACTED]")
                .field("base_path", base_path)
                .finish(),
            BackendSettings::Server { url, api_key, token } => f
                .debug_struct("Server")
                .field("url", url)
                .field("api_key", &api_key.as_ref().map(|_| "[REDACTED]"))
                .field("token", &token.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

impl BackendSettings {
    /// Builds the adapter these settings describe.
    ///
    /// Uses a blocking HTTP client; call outside of an async context.
    pub fn build_adapter(&self, timeout: Duration) -> SyncResult<Arc<dyn StorageAdapter>> {
        let url = match self {
            BackendSettings::Webdav { url, .. } | BackendSettings::Server { url, .. } => url,
        };
        if url.trim().is_empty() {
            return Err(SyncError::Config("backend url is empty".into()));
        }

        let client = ReqwestClient::new(timeout)?;
        let adapter: Arc<dyn StorageAdapter> = match self {
            BackendSettings::Webdav {
                url,
                username,
                password,
                base_path,
            } => {
                let config = WebDavConfig::new(url)
                    .with_credentials(username, password)
                    .with_base_path(base_path);
                Arc::new(WebDavAdapter::new(config, client))
            }
            BackendSettings::Server { url, api_key, token } => {
                let mut config = ServerAdapterConfig::new(url);
                if let Some(key) = api_key {
                    config = config.with_api_key(key);
                }
                if let Some(token) = token {
                    config = config.with_token(token);
                }
                Arc::new(ServerAdapter::new(config, client))
            }
        };
        Ok(adapter)
    }
}

/// Persisted sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Master switch.
    pub enabled: bool,
    /// Backend to sync against.
    pub backend: Option<BackendSettings>,
    /// Encrypt every pushed payload.
    pub encryption_enabled: bool,
    /// File holding the base64 master key.
    pub key_file: Option<PathBuf>,
    /// Minutes between periodic sessions. Zero disables.
    pub sync_interval_minutes: u64,
    /// Quiet period after local edits.
    pub change_debounce_seconds: u64,
    /// Run a session at start-up.
    pub auto_sync_on_start: bool,
    /// Sync after local edits.
    pub sync_on_change: bool,
    /// Replicated modules.
    pub modules: ModuleSet,
    /// Conflict policy.
    pub conflict_policy: ConflictPolicy,
    /// Lock lease in seconds.
    pub lock_timeout_seconds: u64,
    /// Always-encrypted item types.
    pub sensitive_types: SensitiveTypes,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: None,
            encryption_enabled: false,
            key_file: None,
            sync_interval_minutes: 5,
            change_debounce_seconds: 30,
            auto_sync_on_start: false,
            sync_on_change: true,
            modules: ModuleSet::all(),
            conflict_policy: ConflictPolicy::default(),
            lock_timeout_seconds: 300,
            sensitive_types: SensitiveTypes::default(),
        }
    }
}

impl SyncSettings {
    /// Engine configuration for `device_id`.
    pub fn to_sync_config(&self, device_id: impl Into<String>) -> SyncConfig {
        SyncConfig::new(device_id)
            .with_encryption(self.encryption_enabled)
            .with_modules(self.modules.clone())
            .with_sensitive_types(self.sensitive_types.clone())
            .with_conflict_policy(self.conflict_policy)
            .with_lock_timeout(Duration::from_secs(self.lock_timeout_seconds))
    }

    /// Scheduler configuration.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_sync_interval(Duration::from_secs(self.sync_interval_minutes * 60))
            .with_change_debounce(Duration::from_secs(self.change_debounce_seconds))
            .with_auto_sync_on_start(self.auto_sync_on_start)
            .with_sync_on_change(self.sync_on_change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbsync_protocol::SyncModule;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("laptop")
            .with_page_limit(0)
            .with_push_batch_size(10)
            .with_conflict_policy(ConflictPolicy::LocalWins);

        assert_eq!(config.device_id, "laptop");
        assert_eq!(config.page_limit, 1);
        assert_eq!(config.push_batch_size, 10);
        assert_eq!(config.lock_timeout, Duration::from_secs(300));
        assert_eq!(config.conflict_policy, ConflictPolicy::LocalWins);
    }

    #[test]
    fn sensitive_types_always_encrypt() {
        let config = SyncConfig::new("d");
        assert!(config.must_encrypt("vault_entry"));
        assert!(!config.must_encrypt("note"));
        assert!(config.with_encryption(true).must_encrypt("note"));
    }

    #[test]
    fn zero_interval_disables_periodic_sync() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.with_sync_interval(Duration::ZERO).interval(), None);
    }

    #[test]
    fn settings_defaults_from_empty_document() {
        let settings: SyncSettings = from_json("{}");
        assert_eq!(settings, SyncSettings::default());
        assert_eq!(settings.sync_interval_minutes, 5);
        assert!(settings.modules.contains(SyncModule::Vault));
    }

    #[test]
    fn settings_translate_to_runtime_configs() {
        let settings = SyncSettings {
            sync_interval_minutes: 0,
            change_debounce_seconds: 2,
            lock_timeout_seconds: 60,
            encryption_enabled: true,
            ..SyncSettings::default()
        };
        let scheduler = settings.to_scheduler_config();
        assert_eq!(scheduler.interval(), None);
        assert_eq!(scheduler.change_debounce, Duration::from_secs(2));

        let config = settings.to_sync_config("phone");
        assert_eq!(config.lock_timeout, Duration::from_secs(60));
        assert!(config.encryption_enabled);
    }

    #[test]
    fn backend_is_tagged_and_redacted() {
        let backend: BackendSettings = from_json(
            r#"{"kind":"webdav","url":"https://dav.example.com","username":"u","password":"hunter2"}"#,
        );
        match &backend {
            BackendSettings::Webdav { base_path, .. } => assert_eq!(base_path, "/kbsync"),
            other => panic!("unexpected backend {other:?}"),
        }
        assert!(!format!("{backend:?}").contains("hunter2"));
    }

    #[test]
    fn empty_url_is_rejected() {
        let backend = BackendSettings::Server {
            url: String::new(),
            api_key: None,
            token: None,
        };
        assert!(matches!(
            backend.build_adapter(Duration::from_secs(1)),
            Err(SyncError::Config(_))
        ));
    }

    fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> T {
        serde_json::from_str(json).unwrap()
    }
}
