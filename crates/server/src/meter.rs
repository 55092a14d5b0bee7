//! Per-connection instrumentation.
//!
//! The transport is wrapped in a byte-counting adapter whose counters feed
//! the access log and whose activity timestamp resets the stall timers:
//! "any I/O" for the purposes of `request_timeout` is literally any read or
//! write on this stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What the connection is currently doing; drives which timer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnMode {
    /// Between requests on a keep-alive connection.
    Idle = 0,
    /// A request is in flight.
    Handling = 1,
    /// Upgraded to a WebSocket session; never returns to `Idle`.
    WebSocket = 2,
    /// Streaming Server-Sent Events; never returns to `Idle`.
    Sse = 3,
}

/// Counters shared between the metered stream, the request bridge, and the
/// connection watchdog.
pub(crate) struct ConnStats {
    epoch: Instant,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// Milliseconds since `epoch` of the last read or write.
    last_activity_ms: AtomicU64,
    mode: AtomicU8,
}

impl ConnStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            mode: AtomicU8::new(ConnMode::Idle as u8),
        })
    }

    pub fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn set_mode(&self, mode: ConnMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn mode(&self) -> ConnMode {
        match self.mode.load(Ordering::Relaxed) {
            1 => ConnMode::Handling,
            2 => ConnMode::WebSocket,
            3 => ConnMode::Sse,
            _ => ConnMode::Idle,
        }
    }
}

/// Lets request-level code ask the connection to close once the current
/// response is finished (oversized bodies, poisoned keep-alive framing,
/// per-worker request budgets).
#[derive(Default)]
pub(crate) struct CloseSignal {
    requested: std::sync::atomic::AtomicBool,
    notify: tokio::sync::Notify,
}

impl CloseSignal {
    pub fn request(&self) {
        self.requested.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    pub async fn wait(&self) {
        while !self.requested() {
            let notified = self.notify.notified();
            if self.requested() {
                return;
            }
            notified.await;
        }
    }
}

pin_project! {
    /// A transport wrapper that counts bytes and refreshes the activity
    /// timestamp on every successful read or write.
    pub(crate) struct MeteredStream<S> {
        #[pin]
        inner: S,
        stats: Arc<ConnStats>,
    }
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, stats: Arc<ConnStats>) -> Self {
        Self { inner, stats }
    }
}

impl<S: AsyncRead> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.stats.add_read(n as u64);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.stats.add_written(*n as u64);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.stats.add_written(*n as u64);
            }
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_bytes_both_ways() {
        let (client, server) = tokio::io::duplex(1024);
        let stats = ConnStats::new();
        let mut metered = MeteredStream::new(server, stats.clone());
        let mut client = client;

        client.write_all(b"ping!").await.unwrap();
        let mut buf = [0u8; 5];
        metered.read_exact(&mut buf).await.unwrap();
        assert_eq!(stats.bytes_read(), 5);

        metered.write_all(b"pong").await.unwrap();
        assert_eq!(stats.bytes_written(), 4);
        assert!(stats.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn mode_round_trips() {
        let stats = ConnStats::new();
        assert_eq!(stats.mode(), ConnMode::Idle);
        stats.set_mode(ConnMode::WebSocket);
        assert_eq!(stats.mode(), ConnMode::WebSocket);
    }
}
