//! PAGI: an asynchronous gateway interface.
//!
//! A protocol for decoupling network servers from application code: typed
//! event streams flow between a multi-protocol reference server and any
//! application callable, with a routing and middleware core for building on
//! top. This crate is the facade over the workspace members:
//!
//! * [`pagi_protocol`]: the scope/event vocabulary and the
//!   [`Application`]/[`Middleware`] traits;
//! * [`pagi_router`]: path/method dispatch with groups, mounts, and named
//!   routes;
//! * [`pagi_server`]: the HTTP/1.1 + HTTP/2 + WebSocket + SSE server with
//!   TLS, admission control, graceful drain, and pre-fork workers;
//! * [`pagi_helpers`]: Request/Response/WebSocket/SSE wrappers.
//!
//! # A minimal application
//!
//! ```ignore
//! use pagi::{Request, Response, Router, Server, ServerConfig};
//!
//! let mut router = Router::new();
//! router.get("/", |scope: pagi::Scope, receive, send| async move {
//!     let pagi::Scope::Http(request) = scope else { unreachable!() };
//!     Response::new(send).text("Hello").await?;
//!     Ok(())
//! })?;
//!
//! Server::new(ServerConfig::default(), router.to_app())?.run().await
//! ```

pub use pagi_helpers as helpers;
pub use pagi_protocol as protocol;
pub use pagi_router as router;
pub use pagi_server as server;

pub use pagi_protocol::{
    AppError, AppEvent, Application, BodyPayload, CloseCode, Middleware, Next, PagiInfo,
    PathParams, ProtocolError, Receiver, RequestScope, Scheme, Scope, ScopeKind, Sender,
    ServerEvent, SharedApp, SharedMiddleware, SseFrame, Stash, State, Tasks, TlsInfo,
    WebSocketScope, WsPayload,
};

pub use pagi_router::{MethodSpec, Router, RouterApp, RouterError, TrailingSlash};

pub use pagi_server::{
    run_multi_worker, AccessLogSettings, AccessLogTarget, BoundServer, H2Settings, LifespanError,
    LifespanHooks, Server, ServerConfig, ServerHandle, TlsSettings, TlsVersion,
    EXIT_LIFESPAN_FAILURE,
};

pub use pagi_helpers::{Request, Response, Sse, Upload, WebSocket};
