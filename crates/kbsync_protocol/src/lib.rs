//! # kbsync Protocol
//!
//! Data model and wire types shared by the kbsync engine, its storage
//! adapters and the reference server.
//!
//! This crate provides:
//! - [`Item`], the unit of replication, and its [`SyncStatus`]
//! - [`ChangeRecord`] pages for incremental change discovery
//! - Remote documents: [`SyncCursor`], [`RemoteMeta`], [`Lock`]
//! - Sync modules and the always-encrypt type table
//! - Conflict policies
//! - JSON request/response bodies for the REST backend
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod item;
mod messages;
mod module;
mod remote;

pub use conflict::{Conflict, ConflictPolicy, ConflictResolution};
pub use error::{ProtocolError, ProtocolResult};
pub use item::{ChangePage, ChangeRecord, Item, SyncStatus};
pub use messages::{
    BatchPutRequest, BatchPutResponse, BatchPutResult, ErrorResponse, HealthResponse,
    LockRequest, LockResponse, PutItemResponse, ReleaseLockRequest, ServerStatus,
};
pub use module::{ModuleSet, SensitiveTypes, SyncModule};
pub use remote::{Lock, LockStatus, PutOutcome, RemoteMeta, SyncCursor};

/// Protocol version written into [`RemoteMeta`].
pub const PROTOCOL_VERSION: &str = "1.0";

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
