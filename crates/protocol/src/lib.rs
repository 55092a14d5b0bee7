//! The PAGI protocol vocabulary.
//!
//! This crate defines the seam between a PAGI server and a PAGI application:
//! the [`Scope`] delivered when a connection (or lifecycle phase) begins, the
//! two event unions that flow across the seam ([`ServerEvent`] toward the
//! application, [`AppEvent`] back toward the server), and the [`Application`]
//! and [`Middleware`] traits every callable implements.
//!
//! Nothing in here performs I/O. Servers bridge transports onto
//! [`Receiver`]/[`Sender`] pairs; applications consume and produce events and
//! never see a socket.

mod app;
mod channel;
mod events;
mod scope;
mod state;
mod tasks;
mod validate;

pub use app::{AppError, Application, Middleware, Next, SharedApp, SharedMiddleware};
pub use channel::{
    app_channel, server_channel, AppEventQueue, EventSink, EventSource, Receiver, Sender,
    ServerEventQueue, WriteBudget,
};
pub use events::{
    AppEvent, BodyPayload, CloseCode, ProtocolError, ScopeKind, ServerEvent, SseFrame, WsPayload,
};
pub use scope::{LifespanScope, PagiInfo, PathParams, RequestScope, Scheme, Scope, TlsInfo, WebSocketScope};
pub use state::{State, Stash};
pub use tasks::{TaskQueue, Tasks};
pub use validate::validating_sender;

/// The PAGI implementation version carried in every scope.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The PAGI protocol revision this crate speaks.
pub const SPEC_VERSION: &str = "1.0";
