//! The PAGI reference server.
//!
//! A multi-protocol (HTTP/1.1, HTTP/2, WebSocket, SSE), optionally
//! TLS-terminating, optionally multi-worker network server that speaks PAGI
//! to a user-supplied application. The framing layers (hyper, tungstenite,
//! rustls) are consumed as black boxes; everything above them (connection
//! lifecycle, scope classification, event bridging, backpressure, timers,
//! admission, drain, and worker supervision) lives here.

mod accesslog;
mod body;
mod config;
mod connection;
mod http;
mod lifespan;
mod meter;
mod server;
mod sse;
mod tls;
mod workers;
mod ws;

pub use accesslog::{AccessLog, LogFormat, LogRecord, COMBINED_FORMAT, COMMON_FORMAT};
pub use config::{
    AccessLogSettings, AccessLogTarget, H2Settings, ServerConfig, TlsSettings, TlsVersion,
};
pub use lifespan::{Lifespan, LifespanError, LifespanHooks};
pub use server::{BoundServer, Server, ServerHandle};
pub use workers::{run_multi_worker, EXIT_FAILURE, EXIT_LIFESPAN_FAILURE, EXIT_OK};
