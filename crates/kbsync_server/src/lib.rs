//! # kbsync Server
//!
//! Reference REST backend for kbsync.
//!
//! This crate provides:
//! - Item, change-log, resource, cursor, metadata and lock endpoints
//! - In-memory backend state with a numeric change sequence
//! - Optional authentication (static API key, HMAC-SHA256 bearer tokens)
//!
//! # Architecture
//!
//! The server is transport-agnostic. [`SyncServer::handle`] takes a
//! method, request target, headers and body and returns a [`Response`];
//! wiring it to an HTTP listener is left to the embedding process.
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust
//! use kbsync_server::{ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_auth(b"my-secure-secret".to_vec());
//! let server = SyncServer::new(config);
//! let token = server.issue_token("laptop-1").unwrap().unwrap();
//! assert!(token.starts_with("laptop-1."));
//! ```
//!
//! # Endpoints
//!
//! | Method | Path | Body |
//! |---|---|---|
//! | GET | `/api/health` | `HealthResponse` (no auth) |
//! | GET | `/api/status` | `ServerStatus` |
//! | GET, PUT | `/api/meta` | `RemoteMeta` |
//! | GET | `/api/changes?cursor=&limit=` | `ChangePage` |
//! | GET, PUT, DELETE | `/api/items/{id}` | `Item` |
//! | POST | `/api/items/batch` | `BatchPutRequest` |
//! | GET, PUT, DELETE | `/api/resources/{id}` | raw bytes |
//! | GET, PUT | `/api/sync/cursor?device=` | `SyncCursor` |
//! | GET, POST, DELETE | `/api/sync/lock` | `LockStatus`, `LockRequest`, `ReleaseLockRequest` |

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod store;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, Request, RequestHandler, Response};
pub use server::SyncServer;
pub use store::{Resource, ServerStore};
