use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Version};
use indexmap::IndexMap;

use crate::events::ScopeKind;
use crate::state::{Stash, State};
use crate::tasks::Tasks;

/// Identity of the runtime delivering a scope.
#[derive(Debug, Clone)]
pub struct PagiInfo {
    /// Implementation version.
    pub version: &'static str,
    /// Protocol revision.
    pub spec_version: &'static str,
    /// True when this process is a supervised worker.
    pub is_worker: bool,
    /// Worker ordinal, 0 in single-process mode.
    pub worker_num: u32,
}

impl PagiInfo {
    pub fn single_process() -> Self {
        Self {
            version: crate::VERSION,
            spec_version: crate::SPEC_VERSION,
            is_worker: false,
            worker_num: 0,
        }
    }

    pub fn worker(worker_num: u32) -> Self {
        Self {
            is_worker: true,
            worker_num,
            ..Self::single_process()
        }
    }
}

/// Negotiated TLS session properties, present on scopes that arrived over a
/// terminated TLS connection.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Protocol version, e.g. `TLSv1.3`.
    pub protocol: String,
    /// Negotiated cipher suite name.
    pub cipher: String,
    /// ALPN protocol selected during the handshake, if any.
    pub alpn: Option<String>,
    /// SNI hostname presented by the client, if any.
    pub sni_hostname: Option<String>,
    /// Whether a client certificate was presented and verified.
    pub client_cert_verified: bool,
}

/// URL scheme the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// The scheme for the WebSocket flavor of this transport.
    pub fn ws_str(&self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters captured from the path by the router, in capture order.
#[derive(Debug, Clone, Default)]
pub struct PathParams(IndexMap<String, String>);

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PathParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Context for one HTTP-family request: everything the server knew when the
/// request head was read, plus the slots the router fills in.
///
/// The server constructs this once per request/session and never mutates it
/// afterwards; the router sets [`path_params`](Self::path_params),
/// [`route`](Self::route) and, for mounts, rewrites
/// [`path`](Self::path)/[`root_path`](Self::root_path) before delegating.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub method: Method,
    /// Percent-decoded UTF-8 path.
    pub path: String,
    /// Path exactly as received, undecoded.
    pub raw_path: Bytes,
    /// Query string bytes, without the leading `?`.
    pub query_string: Bytes,
    /// Request headers; names are lowercased by the framing layer.
    pub headers: HeaderMap,
    pub scheme: Scheme,
    pub http_version: Version,
    /// Peer address.
    pub client: SocketAddr,
    /// Local address the connection was accepted on.
    pub server: SocketAddr,
    pub tls: Option<Arc<TlsInfo>>,
    /// Prefix consumed by enclosing mounts; empty at the top level.
    pub root_path: String,
    pub pagi: PagiInfo,
    /// Startup-owned shared state, one instance per process.
    pub state: State,
    /// Per-request bag for middleware ↔ handler communication.
    pub stash: Stash,
    /// Fire-and-forget task sink; tasks run after the handler returns.
    pub tasks: Tasks,
    /// Captures from the matched route; empty until the router dispatches.
    pub path_params: PathParams,
    /// Template of the matched route, e.g. `/users/{id}`.
    pub route: Option<Arc<str>>,
}

impl RequestScope {
    /// Host + port rendering of the peer address.
    pub fn client_str(&self) -> String {
        self.client.to_string()
    }
}

/// A WebSocket session scope: the HTTP request that initiated the handshake
/// plus the subprotocols the client proposed.
#[derive(Debug, Clone)]
pub struct WebSocketScope {
    pub request: RequestScope,
    /// Client-proposed subprotocol names, in header order.
    pub subprotocols: Vec<String>,
}

/// Scope for the process-lifecycle protocol.
#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub pagi: PagiInfo,
    pub state: State,
}

/// The context delivered as the first argument to an application.
#[derive(Debug, Clone)]
pub enum Scope {
    Http(RequestScope),
    WebSocket(WebSocketScope),
    Sse(RequestScope),
    Lifespan(LifespanScope),
}

impl Scope {
    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::Http(_) => ScopeKind::Http,
            Scope::WebSocket(_) => ScopeKind::WebSocket,
            Scope::Sse(_) => ScopeKind::Sse,
            Scope::Lifespan(_) => ScopeKind::Lifespan,
        }
    }

    /// The request context, for any scope kind that has one.
    pub fn request(&self) -> Option<&RequestScope> {
        match self {
            Scope::Http(r) | Scope::Sse(r) => Some(r),
            Scope::WebSocket(ws) => Some(&ws.request),
            Scope::Lifespan(_) => None,
        }
    }

    pub fn request_mut(&mut self) -> Option<&mut RequestScope> {
        match self {
            Scope::Http(r) | Scope::Sse(r) => Some(r),
            Scope::WebSocket(ws) => Some(&mut ws.request),
            Scope::Lifespan(_) => None,
        }
    }

    /// The shared state handle, present on every scope kind.
    pub fn state(&self) -> &State {
        match self {
            Scope::Http(r) | Scope::Sse(r) => &r.state,
            Scope::WebSocket(ws) => &ws.request.state,
            Scope::Lifespan(l) => &l.state,
        }
    }

    pub fn pagi(&self) -> &PagiInfo {
        match self {
            Scope::Http(r) | Scope::Sse(r) => &r.pagi,
            Scope::WebSocket(ws) => &ws.request.pagi,
            Scope::Lifespan(l) => &l.pagi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_fixture() -> RequestScope {
        RequestScope {
            method: Method::GET,
            path: "/widgets/42".into(),
            raw_path: Bytes::from_static(b"/widgets/42"),
            query_string: Bytes::from_static(b"page=2"),
            headers: HeaderMap::new(),
            scheme: Scheme::Http,
            http_version: Version::HTTP_11,
            client: "127.0.0.1:50000".parse().unwrap(),
            server: "127.0.0.1:8080".parse().unwrap(),
            tls: None,
            root_path: String::new(),
            pagi: PagiInfo::single_process(),
            state: State::new(),
            stash: Stash::new(),
            tasks: Tasks::disconnected(),
            path_params: PathParams::new(),
            route: None,
        }
    }

    #[test]
    fn scope_kind_and_request_accessors() {
        let scope = Scope::Http(scope_fixture());
        assert_eq!(scope.kind(), ScopeKind::Http);
        assert_eq!(scope.request().unwrap().path, "/widgets/42");

        let ws = Scope::WebSocket(WebSocketScope {
            request: scope_fixture(),
            subprotocols: vec!["chat".into()],
        });
        assert_eq!(ws.kind(), ScopeKind::WebSocket);
        assert!(ws.request().is_some());

        let lifespan = Scope::Lifespan(LifespanScope {
            pagi: PagiInfo::worker(3),
            state: State::new(),
        });
        assert!(lifespan.request().is_none());
        assert!(lifespan.pagi().is_worker);
        assert_eq!(lifespan.pagi().worker_num, 3);
    }

    #[test]
    fn path_params_preserve_capture_order() {
        let mut params = PathParams::new();
        params.insert("b", "2");
        params.insert("a", "1");
        let keys: Vec<_> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get("missing"), None);
    }
}
