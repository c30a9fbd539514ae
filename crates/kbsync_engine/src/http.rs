//! HTTP client abstraction.
//!
//! Adapters talk to their backends through [`HttpClient`]. The production
//! implementation is [`ReqwestClient`]; tests route requests straight into
//! an in-process server with [`LoopbackClient`].

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// HTTP methods used by the adapters, including the WebDAV extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
    /// DELETE
    Delete,
    /// WebDAV MKCOL
    Mkcol,
    /// WebDAV PROPFIND
    Propfind,
}

impl Method {
    /// Method name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Mkcol => "MKCOL",
            Method::Propfind => "PROPFIND",
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a request with no headers and an empty body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a raw body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize>(self, value: &T) -> SyncResult<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    /// Looks up a header, ignoring case.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path and query of the URL, starting with `/`.
    pub fn path(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A body-less response.
    pub fn empty(status: u16) -> Self {
        Self::new(status, Vec::new())
    }

    /// A JSON response. Serialization failures become a 500.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status, body),
            Err(e) => Self::new(500, e.to_string()),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the JSON body.
    pub fn parse_json<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| SyncError::Protocol(format!("invalid JSON response: {e}")))
    }

    /// Converts non-2xx statuses into errors.
    pub fn error_for_status(self) -> SyncResult<Self> {
        match self.status {
            s if (200..300).contains(&s) => Ok(self),
            401 | 403 => Err(SyncError::AuthenticationFailed(format!(
                "status {}",
                self.status
            ))),
            status => Err(SyncError::Http {
                status,
                message: self.text(),
            }),
        }
    }
}

/// HTTP client abstraction.
///
/// Implementations perform the request and return whatever status the
/// backend produced. Only failures to get a response at all are errors.
pub trait HttpClient: Send + Sync {
    /// Executes a request.
    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse>;
}

/// Blocking `reqwest` client with a per-request timeout.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Builds a client whose requests time out after `timeout`.
    ///
    /// Must be called outside of an async context.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| SyncError::Protocol(e.to_string()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body).send().map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::transport_retryable(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| SyncError::transport_retryable(e.to_string()))?;
        Ok(HttpResponse::new(status, body.to_vec()))
    }
}

/// Trait for in-process servers that can answer loopback requests.
pub trait LoopbackServer {
    /// Handles a request and returns the response.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        (**self).handle(request)
    }
}

/// A client that routes requests directly to a server in the same process.
///
/// Reachability can be toggled to simulate a network outage.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    reachable: AtomicBool,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a loopback client connected to `server`.
    pub fn new(server: S) -> Self {
        Self {
            server,
            reachable: AtomicBool::new(true),
        }
    }

    /// Makes every subsequent request fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("connection refused"));
        }
        Ok(self.server.handle(&request))
    }
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        (**self).execute(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl LoopbackServer for Echo {
        fn handle(&self, request: &HttpRequest) -> HttpResponse {
            HttpResponse::new(200, format!("{} {}", request.method.as_str(), request.path()))
        }
    }

    #[test]
    fn request_path_extraction() {
        let req = HttpRequest::new(Method::Get, "https://dav.example.com/remote.php/kb/items/");
        assert_eq!(req.path(), "/remote.php/kb/items/");
        assert_eq!(HttpRequest::new(Method::Get, "http://host").path(), "/");
        assert_eq!(
            HttpRequest::new(Method::Get, "/api/meta?x=1").path(),
            "/api/meta?x=1"
        );
    }

    #[test]
    fn header_lookup_ignores_case() {
        let req = HttpRequest::new(Method::Get, "http://h/").header("X-API-Key", "k");
        assert_eq!(req.header_value("x-api-key"), Some("k"));
        assert_eq!(req.header_value("authorization"), None);
    }

    #[test]
    fn json_body_sets_content_type() {
        let req = HttpRequest::new(Method::Put, "http://h/a")
            .json(&serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(req.header_value("content-type"), Some("application/json"));
        assert_eq!(req.body, br#"{"a":1}"#);
    }

    #[test]
    fn status_mapping() {
        assert!(HttpResponse::empty(204).error_for_status().is_ok());
        assert!(matches!(
            HttpResponse::empty(401).error_for_status(),
            Err(SyncError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            HttpResponse::new(500, "boom").error_for_status(),
            Err(SyncError::Http { status: 500, .. })
        ));
    }

    #[test]
    fn loopback_routes_and_can_go_offline() {
        let client = LoopbackClient::new(Echo);
        let resp = client
            .execute(HttpRequest::new(Method::Mkcol, "http://dav/kb/items/"))
            .unwrap();
        assert_eq!(resp.text(), "MKCOL /kb/items/");

        client.set_reachable(false);
        let err = client
            .execute(HttpRequest::new(Method::Get, "http://dav/kb"))
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
