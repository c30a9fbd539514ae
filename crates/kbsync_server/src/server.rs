//! Main sync server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::{HandlerContext, Request, RequestHandler, Response};
use crate::store::ServerStore;
use kbsync_protocol::ServerStatus;
use std::sync::Arc;

/// The reference REST backend.
///
/// Transport-agnostic: an HTTP front end passes each request's method,
/// target, headers and body to [`handle`](Self::handle) and writes the
/// returned [`Response`].
///
/// # Example
///
/// ```
/// use kbsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let response = server.handle("GET", "/api/health", &[], b"");
/// assert_eq!(response.status, 200);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a server with empty state.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(ServerStore::new()))
    }

    /// Creates a server over existing state.
    pub fn with_store(config: ServerConfig, store: Arc<ServerStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Handles one request.
    pub fn handle(
        &self,
        method: &str,
        target: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Response {
        self.handler
            .handle(&Request::new(method, target, headers, body))
    }

    /// Issues a bearer token for `device_id`, if token auth is enabled.
    pub fn issue_token(&self, device_id: &str) -> Option<ServerResult<String>> {
        self.context
            .validator()
            .map(|validator| validator.create_token(device_id))
    }

    /// Backend state.
    pub fn store(&self) -> &Arc<ServerStore> {
        &self.context.store
    }

    /// Summary counters.
    pub fn status(&self) -> ServerStatus {
        self.context.store.status(kbsync_protocol::now_millis())
    }
}
