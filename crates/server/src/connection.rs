//! The per-connection state machine.
//!
//! Each accepted transport is owned by exactly one connection task: it runs
//! the framing layer (HTTP/1.1 or HTTP/2, selected by ALPN or preface),
//! bridges requests to the application, enforces the per-mode timers, and
//! participates in the graceful drain. The connection registers itself in
//! the server's live set on entry and is removed exactly once on exit.

use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use pagi_protocol::{Scheme, TlsInfo};

use crate::http;
use crate::meter::{CloseSignal, ConnMode, ConnStats, MeteredStream};
use crate::server::{Core, Phase};

/// Per-connection context shared with the request bridge.
pub(crate) struct ConnContext {
    pub core: Arc<Core>,
    pub stats: Arc<ConnStats>,
    pub close: Arc<CloseSignal>,
    pub client: std::net::SocketAddr,
    pub local: std::net::SocketAddr,
    pub scheme: Scheme,
    pub tls: Option<Arc<TlsInfo>>,
    /// The long-lived WebSocket/SSE task, once a request switches modes.
    pub pump: Mutex<Option<JoinHandle<()>>>,
}

/// Serve one accepted (and TLS-terminated, where applicable) transport.
pub(crate) async fn serve<S>(
    core: Arc<Core>,
    stream: S,
    client: std::net::SocketAddr,
    scheme: Scheme,
    tls: Option<Arc<TlsInfo>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(guard) = core.connections.register() else {
        // The set is gone; the server is past drain.
        return;
    };

    let stats = ConnStats::new();
    stats.touch();
    let ctx = Arc::new(ConnContext {
        core: core.clone(),
        stats: stats.clone(),
        close: Arc::new(CloseSignal::default()),
        client,
        local: core.local_addr,
        scheme,
        tls,
        pump: Mutex::new(None),
    });

    let io = TokioIo::new(MeteredStream::new(stream, stats.clone()));

    let mut builder = auto::Builder::new(TokioExecutor::new());
    {
        let h2 = &core.config.h2;
        builder
            .http1()
            .max_buf_size(core.config.max_header_size.max(8 * 1024))
            .http2()
            .max_concurrent_streams(h2.max_concurrent_streams)
            .initial_stream_window_size(h2.initial_window_size)
            .max_frame_size(h2.max_frame_size)
            .max_header_list_size(h2.max_header_list_size);
        if h2.enable_connect_protocol {
            builder.http2().enable_connect_protocol();
        }
    }

    let service_ctx = ctx.clone();
    let service = service_fn(move |req| {
        let ctx = service_ctx.clone();
        async move { Ok::<_, std::convert::Infallible>(http::handle(ctx, req).await) }
    });

    let mut shutdown = core.shutdown_rx();
    let conn = builder.serve_connection_with_upgrades(io, service);
    let mut conn = std::pin::pin!(conn);
    let mut draining = false;
    let mut close_handled = false;
    let mut idle_closed = false;

    loop {
        if !draining && *shutdown.borrow_and_update() == Phase::Draining {
            draining = true;
            // Idle keep-alive connections close now; an in-flight request
            // finishes first. Long-lived modes are told to go away by
            // their pump tasks watching the same signal.
            conn.as_mut().graceful_shutdown();
        }
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(client = %client, error = %err, "connection ended with error");
                }
                break;
            }
            _ = shutdown.changed() => {}
            _ = ctx.close.wait(), if !close_handled => {
                close_handled = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = guard.force_closed() => {
                tracing::debug!(client = %client, "connection force-closed");
                break;
            }
            fired = watchdog(&core, &stats), if !idle_closed => {
                tracing::debug!(client = %client, mode = ?fired, "connection timer fired");
                match fired {
                    ConnMode::Idle => {
                        // No request in flight; close cleanly (GOAWAY for
                        // h2) and let the framing future wind down.
                        idle_closed = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    // A stalled request or idle long-lived session is not
                    // worth waiting out; drop the transport.
                    _ => break,
                }
            }
        }
    }

    // An upgraded connection resolves the framing future while its pump is
    // still running; keep the task alive until the session ends.
    let pump = ctx.pump.lock().await.take();
    if let Some(pump) = pump {
        tokio::select! {
            _ = pump => {}
            _ = guard.force_closed() => {
                tracing::debug!(client = %client, "long-lived session force-closed");
            }
            fired = watchdog(&core, &stats) => {
                tracing::debug!(client = %client, mode = ?fired, "session timer fired");
            }
        }
    }
}

/// Resolves when the timer for the connection's current mode expires.
/// Modes with a zero timeout never fire; if every timer is disabled this
/// never resolves and costs nothing beyond a coarse mode poll.
async fn watchdog(core: &Arc<Core>, stats: &Arc<ConnStats>) -> ConnMode {
    let config = &core.config;
    if config.timeout.is_zero()
        && config.request_timeout.is_zero()
        && config.ws_idle_timeout.is_zero()
        && config.sse_idle_timeout.is_zero()
    {
        return std::future::pending().await;
    }
    loop {
        let mode = stats.mode();
        let timeout = match mode {
            ConnMode::Idle => config.timeout,
            ConnMode::Handling => config.request_timeout,
            ConnMode::WebSocket => config.ws_idle_timeout,
            ConnMode::Sse => config.sse_idle_timeout,
        };
        if timeout.is_zero() {
            // No timer for this mode; check back in case the mode changes.
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            continue;
        }
        let idle = stats.idle_for();
        if idle >= timeout {
            return mode;
        }
        tokio::time::sleep(timeout - idle).await;
    }
}
