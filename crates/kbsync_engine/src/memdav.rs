//! In-memory WebDAV server for loopback testing.

use crate::http::{HttpRequest, HttpResponse, LoopbackServer, Method};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone)]
enum Node {
    Collection,
    File(Vec<u8>),
}

/// A minimal WebDAV server keeping its tree in memory.
///
/// Supports the subset the adapter uses: `GET`, `PUT`, `DELETE`, `MKCOL`
/// and depth-1 `PROPFIND`. Like real servers it refuses to create a
/// resource whose parent collection is missing.
#[derive(Debug)]
pub struct MemoryDavServer {
    nodes: RwLock<BTreeMap<String, Node>>,
    authorization: Option<String>,
}

impl Default for MemoryDavServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDavServer {
    /// Creates an empty server that accepts anonymous requests.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), Node::Collection);
        Self {
            nodes: RwLock::new(nodes),
            authorization: None,
        }
    }

    /// Requires Basic auth with the given credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        let encoded = BASE64.encode(format!("{username}:{password}"));
        self.authorization = Some(format!("Basic {encoded}"));
        self
    }

    /// Pre-creates the collection at `path` along with its ancestors.
    pub fn with_collection(self, path: &str) -> Self {
        {
            let mut nodes = self.nodes.write();
            let mut current = String::new();
            for segment in normalize(path).split('/').filter(|s| !s.is_empty()) {
                if !current.is_empty() {
                    current.push('/');
                }
                current.push_str(segment);
                nodes.insert(current.clone(), Node::Collection);
            }
        }
        self
    }

    /// Contents of the file at `path`, if any.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.read().get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Returns true if a file or collection exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.nodes.read().contains_key(&normalize(path))
    }

    /// Paths of files directly inside the collection at `path`.
    pub fn files_in(&self, path: &str) -> Vec<String> {
        let parent = normalize(path);
        self.nodes
            .read()
            .iter()
            .filter(|(key, node)| {
                matches!(node, Node::File(_)) && parent_of(key) == Some(parent.as_str())
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Writes a file directly, bypassing the parent check.
    pub fn put_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.nodes
            .write()
            .insert(normalize(path), Node::File(data.into()));
    }

    /// Removes a file or collection directly.
    pub fn remove(&self, path: &str) -> bool {
        self.nodes.write().remove(&normalize(path)).is_some()
    }

    fn authorized(&self, request: &HttpRequest) -> bool {
        match &self.authorization {
            Some(expected) => request.header_value("authorization") == Some(expected.as_str()),
            None => true,
        }
    }

    fn parent_is_collection(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        parent_of(path).is_some_and(|parent| matches!(nodes.get(parent), Some(Node::Collection)))
    }

    fn mkcol(&self, path: String) -> HttpResponse {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&path) {
            return HttpResponse::empty(405);
        }
        if !Self::parent_is_collection(&nodes, &path) {
            return HttpResponse::empty(409);
        }
        nodes.insert(path, Node::Collection);
        HttpResponse::empty(201)
    }

    fn put(&self, path: String, body: &[u8]) -> HttpResponse {
        let mut nodes = self.nodes.write();
        if !Self::parent_is_collection(&nodes, &path) {
            return HttpResponse::empty(409);
        }
        match nodes.insert(path, Node::File(body.to_vec())) {
            Some(Node::File(_)) => HttpResponse::empty(204),
            _ => HttpResponse::empty(201),
        }
    }

    fn get(&self, path: &str) -> HttpResponse {
        match self.nodes.read().get(path) {
            Some(Node::File(data)) => HttpResponse::new(200, data.clone()),
            Some(Node::Collection) => HttpResponse::empty(405),
            None => HttpResponse::empty(404),
        }
    }

    fn delete(&self, path: &str) -> HttpResponse {
        let mut nodes = self.nodes.write();
        if nodes.remove(path).is_none() {
            return HttpResponse::empty(404);
        }
        let prefix = format!("{path}/");
        nodes.retain(|key, _| !key.starts_with(&prefix));
        HttpResponse::empty(204)
    }

    fn propfind(&self, path: &str) -> HttpResponse {
        let nodes = self.nodes.read();
        let Some(node) = nodes.get(path) else {
            return HttpResponse::empty(404);
        };

        let mut body = String::from(
            r#"<?xml version="1.0" encoding="utf-8"?><D:multistatus xmlns:D="DAV:">"#,
        );
        push_response(&mut body, path, node);
        if matches!(node, Node::Collection) {
            for (key, child) in nodes.iter() {
                if parent_of(key) == Some(path) {
                    push_response(&mut body, key, child);
                }
            }
        }
        body.push_str("</D:multistatus>");
        HttpResponse::new(207, body)
    }
}

impl LoopbackServer for MemoryDavServer {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        if !self.authorized(request) {
            return HttpResponse::empty(401);
        }
        let path = normalize(request.path());
        match request.method {
            Method::Mkcol => self.mkcol(path),
            Method::Put => self.put(path, &request.body),
            Method::Get => self.get(&path),
            Method::Delete => self.delete(&path),
            Method::Propfind => self.propfind(&path),
            Method::Post => HttpResponse::empty(405),
        }
    }
}

/// Strips the query, the surrounding slashes and nothing else.
fn normalize(path: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    path.trim_matches('/').to_string()
}

fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map_or("", |(parent, _)| parent))
}

fn push_response(body: &mut String, path: &str, node: &Node) {
    let (href, resource_type) = match node {
        Node::Collection => (format!("/{path}/"), "<D:collection/>"),
        Node::File(_) => (format!("/{path}"), ""),
    };
    let href = href.replace("//", "/");
    // Writing to a String cannot fail.
    let _ = write!(
        body,
        "<D:response><D:href>{href}</D:href><D:propstat><D:prop>\
         <D:resourcetype>{resource_type}</D:resourcetype></D:prop>\
         <D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, path: &str) -> HttpRequest {
        HttpRequest::new(method, format!("http://dav.local{path}"))
    }

    #[test]
    fn collections_must_exist_before_files() {
        let server = MemoryDavServer::new();
        let put = request(Method::Put, "/kb/a.json").body("{}");
        assert_eq!(server.handle(&put).status, 409);

        assert_eq!(server.handle(&request(Method::Mkcol, "/kb/")).status, 201);
        assert_eq!(server.handle(&request(Method::Mkcol, "/kb/")).status, 405);
        assert_eq!(server.handle(&put).status, 201);
        assert_eq!(server.handle(&put).status, 204);
        assert_eq!(server.file("/kb/a.json").unwrap(), b"{}");
    }

    #[test]
    fn preset_collections_include_ancestors() {
        let server = MemoryDavServer::new().with_collection("/remote.php/dav/");
        assert!(server.exists("/remote.php"));
        assert!(server.exists("/remote.php/dav"));
        let mkcol = request(Method::Mkcol, "/remote.php/dav/kb/");
        assert_eq!(server.handle(&mkcol).status, 201);
    }

    #[test]
    fn propfind_lists_direct_children() {
        let server = MemoryDavServer::new();
        server.handle(&request(Method::Mkcol, "/kb"));
        server.handle(&request(Method::Mkcol, "/kb/sub"));
        server.put_file("/kb/x.json", "1");
        server.put_file("/kb/sub/deep.json", "2");

        let response = server.handle(&request(Method::Propfind, "/kb/"));
        assert_eq!(response.status, 207);
        let text = response.text();
        assert!(text.contains("<D:href>/kb/</D:href>"));
        assert!(text.contains("<D:href>/kb/x.json</D:href>"));
        assert!(text.contains("<D:href>/kb/sub/</D:href>"));
        assert!(!text.contains("deep.json"));

        assert_eq!(
            server.handle(&request(Method::Propfind, "/missing/")).status,
            404
        );
    }

    #[test]
    fn delete_removes_subtree() {
        let server = MemoryDavServer::new();
        server.handle(&request(Method::Mkcol, "/kb"));
        server.put_file("/kb/x.json", "1");
        assert_eq!(server.handle(&request(Method::Delete, "/kb")).status, 204);
        assert!(!server.exists("/kb/x.json"));
        assert_eq!(server.handle(&request(Method::Delete, "/kb")).status, 404);
    }

    #[test]
    fn credentials_are_enforced() {
        let server = MemoryDavServer::new().with_credentials("u", "p");
        assert_eq!(server.handle(&request(Method::Get, "/x")).status, 401);

        let authed = request(Method::Get, "/x").header("Authorization", "Basic dTpw");
        assert_eq!(server.handle(&authed).status, 404);
    }
}
