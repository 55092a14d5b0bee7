//! Convenience wrappers over the raw PAGI event streams.
//!
//! Applications can always speak events directly; these adapters cover the
//! common shapes: [`Request`] for draining and parsing request bodies,
//! [`Response`] as a fluent builder with one-shot finishers, [`WebSocket`]
//! for stateful sessions, and [`Sse`] for event streams with keepalive.

mod request;
mod response;
mod sse;
mod websocket;

pub use request::{Request, Upload};
pub use response::{Response, Writer};
pub use sse::Sse;
pub use websocket::WebSocket;
