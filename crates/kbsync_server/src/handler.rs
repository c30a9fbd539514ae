//! Request routing and endpoint handlers.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::{Resource, ServerStore};
use kbsync_protocol::{
    now_millis, BatchPutRequest, BatchPutResponse, BatchPutResult, ErrorResponse,
    HealthResponse, Item, LockRequest, LockResponse, PutItemResponse, ReleaseLockRequest,
    RemoteMeta, SyncCursor, PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_PAGE_SIZE: usize = 100;
const OCTET_STREAM: &str = "application/octet-stream";

/// A request as seen by the handler.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    /// Upper-case method name.
    pub method: &'a str,
    /// Path without the query string.
    pub path: &'a str,
    /// Raw query string, without `?`.
    pub query: &'a str,
    /// Header pairs; names compare case-insensitively.
    pub headers: &'a [(&'a str, &'a str)],
    /// Request body.
    pub body: &'a [u8],
}

impl<'a> Request<'a> {
    /// Splits `target` into path and query.
    pub fn new(
        method: &'a str,
        target: &'a str,
        headers: &'a [(&'a str, &'a str)],
        body: &'a [u8],
    ) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        Self {
            method,
            path,
            query,
            headers,
            body,
        }
    }

    /// First header named `name`.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }

    /// Percent-decoded query parameter.
    pub fn query_param(&self, name: &str) -> ServerResult<Option<String>> {
        for pair in self.query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == name {
                let value = urlencoding::decode(value).map_err(|_| {
                    ServerError::InvalidRequest(format!("query parameter {name} is not UTF-8"))
                })?;
                return Ok(Some(value.into_owned()));
            }
        }
        Ok(None)
    }

    fn json<T: DeserializeOwned>(&self) -> ServerResult<T> {
        serde_json::from_slice(self.body)
            .map_err(|e| ServerError::InvalidRequest(format!("invalid JSON body: {e}")))
    }
}

/// A response ready to be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type`, if there is a body.
    pub content_type: Option<String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    /// An empty response.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }

    /// A JSON response.
    pub fn json<T: Serialize>(status: u16, value: &T) -> ServerResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| ServerError::Internal(format!("encoding response: {e}")))?;
        Ok(Self {
            status,
            content_type: Some("application/json".into()),
            body,
        })
    }

    /// A raw body with its content type.
    pub fn bytes(data: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.into()),
            body: data,
        }
    }

    fn from_error(error: &ServerError) -> Self {
        let body = ErrorResponse {
            error: error.to_string(),
        };
        // A plain string always serializes.
        Self::json(error.status(), &body).unwrap_or_else(|_| Self::empty(error.status()))
    }
}

/// Shared state for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Backend state.
    pub store: Arc<ServerStore>,
    validator: Option<TokenValidator>,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(config: ServerConfig, store: Arc<ServerStore>) -> Self {
        let validator = config.auth_secret.clone().map(|secret| {
            TokenValidator::new(AuthConfig::new(secret).with_expiry(config.token_expiry))
        });
        Self {
            config,
            store,
            validator,
        }
    }

    /// Token validator, if bearer auth is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }
}

/// Who made a request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Caller {
    Anonymous,
    ApiKey,
    Device(String),
}

impl Caller {
    /// Token holders may only act for their own device.
    fn check_device(&self, device_id: &str) -> ServerResult<()> {
        match self {
            Caller::Device(own) if own != device_id => Err(ServerError::NotAuthorized(format!(
                "token for {own} cannot act for {device_id}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Routes requests to endpoint handlers.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a request. Errors become JSON error bodies.
    pub fn handle(&self, request: &Request<'_>) -> Response {
        match self.route(request) {
            Ok(response) => {
                debug!(method = request.method, path = request.path, status = response.status, "request");
                response
            }
            Err(e) => {
                if e.is_server_error() {
                    warn!(method = request.method, path = request.path, error = %e, "request failed");
                } else {
                    debug!(method = request.method, path = request.path, error = %e, "request rejected");
                }
                Response::from_error(&e)
            }
        }
    }

    fn route(&self, request: &Request<'_>) -> ServerResult<Response> {
        let segments: Vec<&str> = request
            .path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();

        if let (["api", "health"], "GET") = (segments.as_slice(), request.method) {
            return Response::json(
                200,
                &HealthResponse {
                    status: "ok".into(),
                    version: PROTOCOL_VERSION.into(),
                },
            );
        }

        let caller = self.authenticate(request)?;

        match (segments.as_slice(), request.method) {
            (["api", "status"], "GET") => {
                Response::json(200, &self.context.store.status(now_millis()))
            }
            (["api", "meta"], "GET") => {
                let meta = self
                    .context
                    .store
                    .meta()
                    .ok_or_else(|| ServerError::NotFound("metadata".into()))?;
                Response::json(200, &meta)
            }
            (["api", "meta"], "PUT") => {
                let meta: RemoteMeta = request.json()?;
                self.context.store.set_meta(meta);
                Ok(Response::empty(204))
            }
            (["api", "changes"], "GET") => self.list_changes(request),
            (["api", "items", "batch"], "POST") => self.batch_put(request),
            (["api", "items", id], method) => self.item(request, &decode(id)?, method),
            (["api", "resources", id], method) => self.resource(request, &decode(id)?, method),
            (["api", "sync", "cursor"], method) => self.cursor(request, &caller, method),
            (["api", "sync", "lock"], method) => self.lock(request, &caller, method),
            _ => Err(ServerError::MethodNotAllowed {
                method: request.method.to_string(),
                path: request.path.to_string(),
            }),
        }
    }

    fn authenticate(&self, request: &Request<'_>) -> ServerResult<Caller> {
        let config = &self.context.config;
        if !config.require_auth() {
            return Ok(Caller::Anonymous);
        }

        if let (Some(expected), Some(given)) = (&config.api_key, request.header("x-api-key")) {
            if expected == given {
                return Ok(Caller::ApiKey);
            }
            return Err(ServerError::AuthenticationFailed("invalid API key".into()));
        }

        if let (Some(validator), Some(header)) =
            (self.context.validator(), request.header("authorization"))
        {
            let token = header.strip_prefix("Bearer ").ok_or_else(|| {
                ServerError::AuthenticationFailed("expected a bearer token".into())
            })?;
            return validator.validate_token(token.trim()).map(Caller::Device);
        }

        Err(ServerError::AuthenticationFailed("missing credentials".into()))
    }

    fn list_changes(&self, request: &Request<'_>) -> ServerResult<Response> {
        let cursor = match request.query_param("cursor")?.as_deref() {
            None | Some("") => 0,
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ServerError::InvalidRequest(format!("invalid cursor {raw:?}")))?,
        };
        let limit = match request.query_param("limit")? {
            None => DEFAULT_PAGE_SIZE,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| ServerError::InvalidRequest(format!("invalid limit {raw:?}")))?,
        };
        let limit = limit.clamp(1, self.context.config.max_page_size);
        Response::json(200, &self.context.store.changes_since(cursor, limit))
    }

    fn item(&self, request: &Request<'_>, id: &str, method: &str) -> ServerResult<Response> {
        let store = &self.context.store;
        match method {
            "GET" => {
                let item = store
                    .get_item(id)
                    .ok_or_else(|| ServerError::NotFound(format!("item {id}")))?;
                Response::json(200, &item)
            }
            "PUT" => {
                let item: Item = request.json()?;
                if item.id != id {
                    return Err(ServerError::InvalidRequest(format!(
                        "body id {} does not match path id {id}",
                        item.id
                    )));
                }
                let remote_rev = store.put_item(item);
                Response::json(200, &PutItemResponse { remote_rev })
            }
            "DELETE" => {
                if !store.delete_item(id) {
                    return Err(ServerError::NotFound(format!("item {id}")));
                }
                Ok(Response::empty(204))
            }
            _ => Err(not_allowed(request)),
        }
    }

    fn batch_put(&self, request: &Request<'_>) -> ServerResult<Response> {
        let batch: BatchPutRequest = request.json()?;
        let limit = self.context.config.max_batch_size;
        if batch.items.len() > limit {
            return Err(ServerError::PayloadTooLarge(format!(
                "{} items exceed the batch limit of {limit}",
                batch.items.len()
            )));
        }

        let results: Vec<BatchPutResult> = batch
            .items
            .into_iter()
            .map(|item| {
                if item.id.is_empty() {
                    return BatchPutResult {
                        id: item.id,
                        remote_rev: None,
                        error: Some("item id is empty".into()),
                    };
                }
                let id = item.id.clone();
                BatchPutResult {
                    id,
                    remote_rev: Some(self.context.store.put_item(item)),
                    error: None,
                }
            })
            .collect();

        let success = results.iter().all(|result| result.error.is_none());
        Response::json(200, &BatchPutResponse { success, results })
    }

    fn resource(&self, request: &Request<'_>, id: &str, method: &str) -> ServerResult<Response> {
        let store = &self.context.store;
        match method {
            "GET" => {
                let resource = store
                    .get_resource(id)
                    .ok_or_else(|| ServerError::NotFound(format!("resource {id}")))?;
                Ok(Response::bytes(resource.data, resource.mime_type))
            }
            "PUT" => {
                let mime_type = request.header("content-type").unwrap_or(OCTET_STREAM);
                store.put_resource(
                    id,
                    Resource {
                        data: request.body.to_vec(),
                        mime_type: mime_type.to_string(),
                    },
                );
                Ok(Response::empty(204))
            }
            "DELETE" => {
                if !store.delete_resource(id) {
                    return Err(ServerError::NotFound(format!("resource {id}")));
                }
                Ok(Response::empty(204))
            }
            _ => Err(not_allowed(request)),
        }
    }

    fn cursor(&self, request: &Request<'_>, caller: &Caller, method: &str) -> ServerResult<Response> {
        let device_id = request
            .query_param("device")?
            .filter(|device| !device.is_empty())
            .ok_or_else(|| ServerError::InvalidRequest("missing device parameter".into()))?;
        caller.check_device(&device_id)?;

        match method {
            "GET" => {
                let cursor = self
                    .context
                    .store
                    .cursor(&device_id)
                    .ok_or_else(|| ServerError::NotFound(format!("cursor for {device_id}")))?;
                Response::json(200, &cursor)
            }
            "PUT" => {
                let cursor: SyncCursor = request.json()?;
                self.context.store.set_cursor(&device_id, cursor);
                Ok(Response::empty(204))
            }
            _ => Err(not_allowed(request)),
        }
    }

    fn lock(&self, request: &Request<'_>, caller: &Caller, method: &str) -> ServerResult<Response> {
        let store = &self.context.store;
        let now = now_millis();
        match method {
            "GET" => Response::json(200, &store.lock_status(now)),
            "POST" => {
                let body: LockRequest = request.json()?;
                caller.check_device(&body.device_id)?;
                if body.device_id.is_empty() || body.timeout <= 0 {
                    return Err(ServerError::InvalidRequest(
                        "lock request needs a device id and a positive timeout".into(),
                    ));
                }
                let max_lease = self.context.config.max_lock_lease.as_millis() as i64;
                let acquired = store.acquire_lock(&body.device_id, body.timeout.min(max_lease), now);
                info!(device_id = %body.device_id, acquired, "lock requested");
                Response::json(200, &LockResponse { acquired })
            }
            "DELETE" => {
                let body: ReleaseLockRequest = request.json()?;
                caller.check_device(&body.device_id)?;
                store.release_lock(&body.device_id, now)?;
                info!(device_id = %body.device_id, "lock released");
                Ok(Response::empty(204))
            }
            _ => Err(not_allowed(request)),
        }
    }
}

fn decode(segment: &str) -> ServerResult<String> {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ServerError::InvalidRequest(format!("path segment {segment:?} is not UTF-8")))
}

fn not_allowed(request: &Request<'_>) -> ServerError {
    ServerError::MethodNotAllowed {
        method: request.method.to_string(),
        path: request.path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbsync_protocol::{ChangePage, LockStatus};

    fn create_handler(config: ServerConfig) -> RequestHandler {
        let context = Arc::new(HandlerContext::new(config, Arc::new(ServerStore::new())));
        RequestHandler::new(context)
    }

    fn send(handler: &RequestHandler, method: &str, target: &str, body: &[u8]) -> Response {
        handler.handle(&Request::new(method, target, &[], body))
    }

    fn json<T: Serialize>(value: &T) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    fn parse<T: DeserializeOwned>(response: &Response) -> T {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn query_parameters_are_decoded() {
        let request = Request::new("GET", "/api/sync/cursor?device=phone%201&x", &[], b"");
        assert_eq!(request.path, "/api/sync/cursor");
        assert_eq!(request.query_param("device").unwrap().as_deref(), Some("phone 1"));
        assert_eq!(request.query_param("x").unwrap().as_deref(), Some(""));
        assert!(request.query_param("y").unwrap().is_none());
    }

    #[test]
    fn put_then_list_changes() {
        let handler = create_handler(ServerConfig::default());
        for n in 0..3 {
            let item = Item::with_id(format!("n{n}"), "note", "body");
            let response = send(&handler, "PUT", &format!("/api/items/n{n}"), &json(&item));
            assert_eq!(response.status, 200);
        }

        let page: ChangePage = parse(&send(&handler, "GET", "/api/changes?limit=2", b""));
        assert_eq!(page.changes.len(), 2);
        assert!(page.has_more);

        let target = format!("/api/changes?cursor={}&limit=2", page.next_cursor.unwrap());
        let page: ChangePage = parse(&send(&handler, "GET", &target, b""));
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].item_id, "n2");
        assert!(!page.has_more);

        assert_eq!(send(&handler, "GET", "/api/changes?cursor=abc", b"").status, 400);
    }

    #[test]
    fn item_id_must_match_path() {
        let handler = create_handler(ServerConfig::default());
        let item = Item::with_id("a", "note", "x");
        assert_eq!(send(&handler, "PUT", "/api/items/b", &json(&item)).status, 400);
        assert_eq!(send(&handler, "GET", "/api/items/a", b"").status, 404);
    }

    #[test]
    fn batch_respects_limit() {
        let handler = create_handler(ServerConfig::default().with_max_batch_size(2));
        let items: Vec<Item> = (0..3)
            .map(|n| Item::with_id(format!("i{n}"), "todo", "x"))
            .collect();
        let response = send(
            &handler,
            "POST",
            "/api/items/batch",
            &json(&BatchPutRequest { items: items.clone() }),
        );
        assert_eq!(response.status, 413);

        let response = send(
            &handler,
            "POST",
            "/api/items/batch",
            &json(&BatchPutRequest {
                items: items[..2].to_vec(),
            }),
        );
        let reply: BatchPutResponse = parse(&response);
        assert!(reply.success);
        assert_eq!(reply.results[1].remote_rev.as_deref(), Some("2"));
    }

    #[test]
    fn lock_lifecycle() {
        let handler = create_handler(ServerConfig::default());
        let lock = |device: &str| {
            json(&LockRequest {
                device_id: device.into(),
                timeout: 60_000,
            })
        };
        let release = |device: &str| {
            json(&ReleaseLockRequest {
                device_id: device.into(),
            })
        };

        let reply: LockResponse = parse(&send(&handler, "POST", "/api/sync/lock", &lock("a")));
        assert!(reply.acquired);
        let reply: LockResponse = parse(&send(&handler, "POST", "/api/sync/lock", &lock("b")));
        assert!(!reply.acquired);

        let status: LockStatus = parse(&send(&handler, "GET", "/api/sync/lock", b""));
        assert!(status.is_held_by("a"));

        assert_eq!(send(&handler, "DELETE", "/api/sync/lock", &release("b")).status, 409);
        assert_eq!(send(&handler, "DELETE", "/api/sync/lock", &release("a")).status, 204);
    }

    #[test]
    fn missing_documents_are_not_found() {
        let handler = create_handler(ServerConfig::default());
        assert_eq!(send(&handler, "GET", "/api/meta", b"").status, 404);
        assert_eq!(send(&handler, "GET", "/api/sync/cursor?device=x", b"").status, 404);
        assert_eq!(send(&handler, "GET", "/api/sync/cursor", b"").status, 400);
        assert_eq!(send(&handler, "PATCH", "/api/meta", b"").status, 405);
    }

    #[test]
    fn resources_keep_content_type() {
        let handler = create_handler(ServerConfig::default());
        let headers = [("Content-Type", "image/png")];
        let put = handler.handle(&Request::new("PUT", "/api/resources/img", &headers, b"png"));
        assert_eq!(put.status, 204);

        let get = send(&handler, "GET", "/api/resources/img", b"");
        assert_eq!(get.body, b"png");
        assert_eq!(get.content_type.as_deref(), Some("image/png"));
        assert_eq!(send(&handler, "DELETE", "/api/resources/img", b"").status, 204);
        assert_eq!(send(&handler, "DELETE", "/api/resources/img", b"").status, 404);
    }

    #[test]
    fn api_key_auth() {
        let handler = create_handler(ServerConfig::default().with_api_key("secret"));
        assert_eq!(send(&handler, "GET", "/api/health", b"").status, 200);
        assert_eq!(send(&handler, "GET", "/api/status", b"").status, 401);

        let wrong = [("X-API-Key", "nope")];
        let request = Request::new("GET", "/api/status", &wrong, b"");
        assert_eq!(handler.handle(&request).status, 401);

        let right = [("x-api-key", "secret")];
        let request = Request::new("GET", "/api/status", &right, b"");
        assert_eq!(handler.handle(&request).status, 200);
    }

    #[test]
    fn bearer_tokens_bind_device() {
        let handler = create_handler(ServerConfig::default().with_auth(b"hmac-secret".to_vec()));
        let token = handler
            .context
            .validator()
            .unwrap()
            .create_token("laptop")
            .unwrap();
        let bearer = format!("Bearer {token}");
        let headers = [("Authorization", bearer.as_str())];

        let own = Request::new("GET", "/api/sync/cursor?device=laptop", &headers, b"");
        assert_eq!(handler.handle(&own).status, 404);

        let other = Request::new("GET", "/api/sync/cursor?device=phone", &headers, b"");
        assert_eq!(handler.handle(&other).status, 403);
    }
}
