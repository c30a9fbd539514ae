//! Paths, settings and engine assembly shared by the commands.

use crate::file_store::FileStore;
use kbsync_crypto::{CryptoEngine, MasterKey};
use kbsync_engine::{DeviceId, SyncEngine, SyncSettings};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-request timeout for backend calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const DEVICE_ID_FILE: &str = "device_id";
const STORE_FILE: &str = "items.json";

/// Where the CLI keeps its files.
pub struct Context {
    config_path: PathBuf,
    data_dir: PathBuf,
}

/// An engine wired to the configured backend and the local file store.
pub struct Session {
    /// Loaded settings.
    pub settings: SyncSettings,
    /// The engine.
    pub engine: Arc<SyncEngine>,
    /// The local store the engine replicates.
    pub store: Arc<FileStore>,
}

impl Context {
    /// Creates a context from the command-line paths.
    pub fn new(config_path: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            config_path,
            data_dir,
        }
    }

    /// Path of the configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Loads this device's id, creating it on first use.
    pub fn device_id(&self) -> Result<DeviceId, Box<dyn std::error::Error>> {
        Ok(DeviceId::load_or_create(&self.data_dir.join(DEVICE_ID_FILE))?)
    }

    /// Reads the configuration file.
    pub fn load_settings(&self) -> Result<SyncSettings, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(&self.config_path).map_err(|e| {
            format!(
                "cannot read {} ({e}); run `kbsync init` first",
                self.config_path.display()
            )
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Writes the configuration file.
    pub fn save_settings(&self, settings: &SyncSettings) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.config_path, toml::to_string_pretty(settings)?)?;
        Ok(())
    }

    /// Opens the local item store.
    pub fn open_store(&self) -> Result<FileStore, Box<dyn std::error::Error>> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(FileStore::open(self.data_dir.join(STORE_FILE))?)
    }

    /// Builds an engine from the configuration file.
    ///
    /// Creates a blocking HTTP client; call outside of an async context.
    pub fn session(&self) -> Result<Session, Box<dyn std::error::Error>> {
        let settings = self.load_settings()?;
        let backend = settings
            .backend
            .as_ref()
            .ok_or("no backend configured")?;
        let adapter = backend.build_adapter(HTTP_TIMEOUT)?;
        debug!(backend = ?backend, "backend configured");

        let device_id = self.device_id()?;
        let store = Arc::new(self.open_store()?);
        let crypto = Arc::new(self.load_crypto(&settings)?);
        let engine = Arc::new(SyncEngine::new(
            settings.to_sync_config(device_id),
            adapter,
            store.clone(),
            crypto,
        ));

        Ok(Session {
            settings,
            engine,
            store,
        })
    }

    /// Loads the master key named by the settings, if any.
    fn load_crypto(&self, settings: &SyncSettings) -> Result<CryptoEngine, Box<dyn std::error::Error>> {
        let Some(key_file) = &settings.key_file else {
            if settings.encryption_enabled {
                return Err("encryption is enabled but no key_file is configured".into());
            }
            return Ok(CryptoEngine::new());
        };

        let path = self.resolve(key_file);
        let encoded = fs::read_to_string(&path)
            .map_err(|e| format!("cannot read key file {}: {e}", path.display()))?;
        let key = MasterKey::from_base64(encoded.trim())?;
        Ok(CryptoEngine::with_key(key))
    }

    /// Resolves `path` relative to the configuration file's directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.config_path.parent() {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        }
    }
}
