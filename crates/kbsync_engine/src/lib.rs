//! # kbsync Engine
//!
//! Replicates a local item store against a remote backend.
//!
//! This crate provides:
//! - The [`StorageAdapter`] contract and two implementations:
//!   [`WebDavAdapter`] (hierarchical file tree) and [`ServerAdapter`] (REST)
//! - The [`LocalStore`] contract the engine consumes
//! - [`SyncEngine`], which runs one sync session
//! - [`SyncScheduler`], which decides when sessions run
//! - Persistent device identity
//!
//! ## Session
//!
//! `connecting → acquiring-lock → verifying-key → pushing → pulling →
//! committing → done | error`
//!
//! 1. Acquire the remote lease lock (fatal on failure)
//! 2. Compare key fingerprints when encryption is on (fatal on mismatch)
//! 3. Push pending local items, encrypting where required
//! 4. Pull the remote change log page by page, persisting the cursor
//!    after every page
//! 5. Stamp the remote metadata
//! 6. Release the lock, whatever happened above
//!
//! ## Key Invariants
//!
//! - Content hashes describe plaintext only
//! - Adapters never propagate failures; they return sentinels
//! - Push and pull process items strictly in order
//! - Under the default conflict policy no edit is discarded

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod config;
mod conflict;
mod device;
mod engine;
mod error;
mod http;
mod memdav;
mod progress;
mod resources;
mod scheduler;
mod server;
mod store;
mod webdav;

pub use adapter::{MemoryAdapter, StorageAdapter};
pub use config::{BackendSettings, SchedulerConfig, SyncConfig, SyncSettings};
pub use conflict::{conflict_copy_payload, title_field, CONFLICT_SUFFIX};
pub use device::DeviceId;
pub use engine::{EngineStatus, FirstSyncCheck, SyncCycleResult, SyncEngine, SyncStats};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, LoopbackClient, LoopbackServer, Method, ReqwestClient,
};
pub use memdav::MemoryDavServer;
pub use progress::{SyncPhase, SyncProgress};
pub use resources::ResourceTransfer;
pub use scheduler::{SchedulerState, SchedulerStatus, SyncScheduler};
pub use server::{ServerAdapter, ServerAdapterConfig};
pub use store::{LocalStore, MemoryStore};
pub use webdav::{extension_for_mime, WebDavAdapter, WebDavConfig};
