use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Discriminates the four scope kinds of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Http,
    WebSocket,
    Sse,
    Lifespan,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Http => "http",
            ScopeKind::WebSocket => "websocket",
            ScopeKind::Sse => "sse",
            ScopeKind::Lifespan => "lifespan",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A WebSocket message payload. Exactly one of text or bytes, by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsPayload {
    Text(String),
    Binary(Bytes),
}

impl WsPayload {
    pub fn len(&self) -> usize {
        match self {
            WsPayload::Text(s) => s.len(),
            WsPayload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal closure.
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// Endpoint going away (server shutdown).
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// Protocol error, e.g. an oversized frame.
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    /// Policy violation, e.g. receive-queue overflow.
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    /// Abnormal closure; never sent on the wire, only reported.
    pub const ABNORMAL: CloseCode = CloseCode(1006);
}

impl Default for CloseCode {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        CloseCode(code)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The source of one response-body installment.
#[derive(Debug)]
pub enum BodyPayload {
    /// In-memory bytes.
    Bytes(Bytes),
    /// Stream a file from disk by path, optionally windowed.
    File {
        path: PathBuf,
        offset: u64,
        length: Option<u64>,
    },
    /// Stream from an already-open handle, from its current position.
    Handle {
        file: tokio::fs::File,
        length: Option<u64>,
    },
}

impl BodyPayload {
    /// Byte count for watermark accounting, where it is knowable up front.
    pub fn queued_len(&self) -> usize {
        match self {
            BodyPayload::Bytes(b) => b.len(),
            // File payloads are streamed by the server in bounded chunks and
            // never sit in the write queue whole.
            BodyPayload::File { .. } | BodyPayload::Handle { .. } => 0,
        }
    }
}

impl From<Bytes> for BodyPayload {
    fn from(b: Bytes) -> Self {
        BodyPayload::Bytes(b)
    }
}

impl From<Vec<u8>> for BodyPayload {
    fn from(v: Vec<u8>) -> Self {
        BodyPayload::Bytes(v.into())
    }
}

impl From<&'static str> for BodyPayload {
    fn from(s: &'static str) -> Self {
        BodyPayload::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// One Server-Sent Events record, or a comment keepalive.
#[derive(Debug, Clone, Default)]
pub struct SseFrame {
    pub data: Option<String>,
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
    pub comment: Option<String>,
    /// `false` ends the stream after this frame.
    pub more: bool,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            more: true,
            ..Self::default()
        }
    }

    pub fn comment(comment: impl Into<String>) -> Self {
        Self {
            comment: Some(comment.into()),
            more: true,
            ..Self::default()
        }
    }
}

/// Events produced by the server and consumed by the application via its
/// `receive` stream.
#[derive(Debug)]
pub enum ServerEvent {
    /// One installment of the request body; repeats until `more` is false.
    HttpRequest { body: Bytes, more: bool },
    /// The client went away before the response completed.
    HttpDisconnect,
    /// First event of every WebSocket scope.
    WebSocketConnect,
    /// A message from the peer.
    WebSocketReceive(WsPayload),
    /// The session ended.
    WebSocketDisconnect { code: CloseCode },
    /// The SSE client closed the stream.
    SseDisconnect,
    LifespanStartup,
    LifespanShutdown,
}

impl ServerEvent {
    /// The dotted protocol name of this event, for logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::HttpRequest { .. } => "http.request",
            ServerEvent::HttpDisconnect => "http.disconnect",
            ServerEvent::WebSocketConnect => "websocket.connect",
            ServerEvent::WebSocketReceive(_) => "websocket.receive",
            ServerEvent::WebSocketDisconnect { .. } => "websocket.disconnect",
            ServerEvent::SseDisconnect => "sse.disconnect",
            ServerEvent::LifespanStartup => "lifespan.startup",
            ServerEvent::LifespanShutdown => "lifespan.shutdown",
        }
    }
}

/// Events produced by the application and consumed by the server via the
/// application's `send` stream.
#[derive(Debug)]
pub enum AppEvent {
    /// Begin an HTTP response. Exactly one per HTTP scope.
    ResponseStart {
        status: StatusCode,
        headers: HeaderMap,
        /// Declares that a `ResponseTrailers` event will follow the body.
        trailers: bool,
    },
    /// One installment of the response body.
    ResponseBody { payload: BodyPayload, more: bool },
    /// Trailing headers; only honored when declared in `ResponseStart` and
    /// the negotiated encoding can carry them.
    ResponseTrailers { headers: HeaderMap, more: bool },
    /// Complete the WebSocket handshake, optionally selecting a subprotocol.
    WebSocketAccept {
        subprotocol: Option<String>,
        headers: HeaderMap,
    },
    /// Send a message to the peer. Only legal after `WebSocketAccept`.
    WebSocketSend(WsPayload),
    /// Close the session, or reject the handshake if not yet accepted.
    WebSocketClose { code: CloseCode, reason: String },
    /// Begin an SSE stream.
    SseStart { headers: HeaderMap },
    /// Emit one SSE record.
    SseEvent(SseFrame),
    StartupComplete,
    StartupFailed { message: String },
    ShutdownComplete,
    ShutdownFailed { message: String },
}

impl AppEvent {
    /// The dotted protocol name of this event, for logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::ResponseStart { .. } => "http.response.start",
            AppEvent::ResponseBody { .. } => "http.response.body",
            AppEvent::ResponseTrailers { .. } => "http.response.trailers",
            AppEvent::WebSocketAccept { .. } => "websocket.accept",
            AppEvent::WebSocketSend(_) => "websocket.send",
            AppEvent::WebSocketClose { .. } => "websocket.close",
            AppEvent::SseStart { .. } => "sse.response.start",
            AppEvent::SseEvent(_) => "sse.response.body",
            AppEvent::StartupComplete => "lifespan.startup.complete",
            AppEvent::StartupFailed { .. } => "lifespan.startup.failed",
            AppEvent::ShutdownComplete => "lifespan.shutdown.complete",
            AppEvent::ShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }

    /// The scope kind this event belongs to.
    pub fn scope_kind(&self) -> ScopeKind {
        match self {
            AppEvent::ResponseStart { .. }
            | AppEvent::ResponseBody { .. }
            | AppEvent::ResponseTrailers { .. } => ScopeKind::Http,
            AppEvent::WebSocketAccept { .. }
            | AppEvent::WebSocketSend(_)
            | AppEvent::WebSocketClose { .. } => ScopeKind::WebSocket,
            AppEvent::SseStart { .. } | AppEvent::SseEvent(_) => ScopeKind::Sse,
            AppEvent::StartupComplete
            | AppEvent::StartupFailed { .. }
            | AppEvent::ShutdownComplete
            | AppEvent::ShutdownFailed { .. } => ScopeKind::Lifespan,
        }
    }
}

/// Errors raised across the server ↔ application seam.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer of the channel is gone; no further events can be delivered.
    #[error("event channel closed")]
    Closed,
    /// The application emitted an event out of sequence for its scope kind.
    /// Only raised when event validation is enabled.
    #[error("invalid event sequence: {0}")]
    InvalidEventSequence(String),
    /// The application emitted an event belonging to a different scope kind.
    #[error("illegal event {event} for {scope} scope")]
    IllegalEvent {
        event: &'static str,
        scope: ScopeKind,
    },
    /// The transport failed while delivering an event.
    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_protocol_vocabulary() {
        let ev = AppEvent::ResponseStart {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            trailers: false,
        };
        assert_eq!(ev.name(), "http.response.start");
        assert_eq!(ev.scope_kind(), ScopeKind::Http);

        let ev = AppEvent::SseEvent(SseFrame::data("tick"));
        assert_eq!(ev.name(), "sse.response.body");
        assert_eq!(ev.scope_kind(), ScopeKind::Sse);

        assert_eq!(ServerEvent::LifespanStartup.name(), "lifespan.startup");
        assert_eq!(
            ServerEvent::WebSocketDisconnect {
                code: CloseCode::NORMAL
            }
            .name(),
            "websocket.disconnect"
        );
    }

    #[test]
    fn body_payload_accounts_only_inline_bytes() {
        assert_eq!(BodyPayload::from("hello").queued_len(), 5);
        let file = BodyPayload::File {
            path: "/tmp/x".into(),
            offset: 0,
            length: Some(1 << 30),
        };
        assert_eq!(file.queued_len(), 0);
    }

    #[test]
    fn close_code_defaults_to_normal() {
        assert_eq!(CloseCode::default(), CloseCode::NORMAL);
        assert_eq!(CloseCode::from(1008), CloseCode::POLICY_VIOLATION);
    }
}
