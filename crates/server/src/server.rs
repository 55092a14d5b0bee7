//! The server core: listeners, admission control, the live-connection set,
//! graceful drain, and the single-process signal contract.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context as _;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, Notify};
use tokio_rustls::TlsAcceptor;

use pagi_protocol::{Application, PagiInfo, Scheme, SharedApp, State};

use crate::accesslog::AccessLog;
use crate::config::ServerConfig;
use crate::connection;
use crate::lifespan::Lifespan;
use crate::tls;

/// Where the server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Running,
    Draining,
}

/// Tracks adopted background tasks so shutdown can wait for them.
pub(crate) struct BackgroundTasks {
    active: AtomicUsize,
    idle: Notify,
}

impl BackgroundTasks {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn adopt(self: &Arc<Self>, task: BoxFuture<'static, ()>) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let tracker = self.clone();
        tokio::spawn(async move {
            task.await;
            if tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                tracker.idle.notify_waiters();
            }
        });
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct SetInner {
    conns: HashMap<u64, Arc<Notify>>,
    accepting: bool,
}

/// The set of live connections, keyed by a per-process id. A connection is
/// present from acceptance until close and removed exactly once, by its
/// guard's drop.
pub(crate) struct ConnectionSet {
    inner: StdMutex<SetInner>,
    next_id: AtomicU64,
    emptied: Notify,
}

impl ConnectionSet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StdMutex::new(SetInner {
                conns: HashMap::new(),
                accepting: true,
            }),
            next_id: AtomicU64::new(1),
            emptied: Notify::new(),
        })
    }

    pub fn register(self: &Arc<Self>) -> Option<ConnGuard> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accepting {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let force = Arc::new(Notify::new());
        inner.conns.insert(id, force.clone());
        Some(ConnGuard {
            id,
            set: self.clone(),
            force,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().conns.len()
    }

    /// Stop admitting and tell every remaining connection to die now.
    pub fn force_close_all(&self) {
        let inner = {
            let mut inner = self.inner.lock().unwrap();
            inner.accepting = false;
            inner.conns.values().cloned().collect::<Vec<_>>()
        };
        for notify in inner {
            notify.notify_one();
        }
    }

    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Membership token for one connection. Dropping it removes the connection
/// from the set, exactly once.
pub(crate) struct ConnGuard {
    id: u64,
    set: Arc<ConnectionSet>,
    force: Arc<Notify>,
}

impl ConnGuard {
    /// Resolves when the server wants this connection gone immediately.
    pub async fn force_closed(&self) {
        self.force.notified().await;
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let empty = {
            let mut inner = self.set.inner.lock().unwrap();
            inner.conns.remove(&self.id);
            inner.conns.is_empty()
        };
        if empty {
            self.set.emptied.notify_waiters();
        }
    }
}

/// Shared server internals, reachable from every connection task.
pub(crate) struct Core {
    pub config: ServerConfig,
    pub app: SharedApp,
    pub state: State,
    pub pagi: PagiInfo,
    pub local_addr: std::net::SocketAddr,
    pub access_log: Option<Arc<AccessLog>>,
    pub tls: Option<TlsAcceptor>,
    pub connections: Arc<ConnectionSet>,
    pub background: Arc<BackgroundTasks>,
    pub requests_served: AtomicU64,
    shutdown_tx: watch::Sender<Phase>,
}

impl Core {
    pub fn shutdown_rx(&self) -> watch::Receiver<Phase> {
        self.shutdown_tx.subscribe()
    }

    pub fn begin_shutdown(&self) {
        // send_replace records the phase even when no receiver is currently
        // subscribed; loops check the value before waiting for changes.
        self.shutdown_tx.send_replace(Phase::Draining);
    }
}

/// Build a listening socket honoring the configured backlog (and, for
/// per-worker sockets, `SO_REUSEPORT`).
pub(crate) fn build_listener(
    addr: std::net::SocketAddr,
    backlog: u32,
    reuseport: bool,
) -> anyhow::Result<std::net::TcpListener> {
    use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage};

    let family = if addr.is_ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .context("creating the listening socket")?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).context("setting SO_REUSEADDR")?;
    if reuseport {
        socket::setsockopt(&fd, sockopt::ReusePort, &true).context("setting SO_REUSEPORT")?;
    }
    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))
        .with_context(|| format!("binding {addr}"))?;
    let backlog = Backlog::new(backlog.min(i32::MAX as u32) as i32).context("listen backlog")?;
    socket::listen(&fd, backlog).context("listening")?;
    Ok(std::net::TcpListener::from(fd))
}

/// The PAGI reference server.
pub struct Server {
    config: ServerConfig,
    app: SharedApp,
}

impl Server {
    pub fn new(config: ServerConfig, app: impl Application) -> anyhow::Result<Self> {
        Self::from_shared(config, Arc::new(app))
    }

    pub fn from_shared(config: ServerConfig, app: SharedApp) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self { config, app })
    }

    /// Single-process entry point: bind, run the lifespan startup, serve
    /// until SIGTERM/SIGINT, then drain gracefully. SIGHUP is logged and
    /// ignored.
    pub async fn run(self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.config.workers == 0,
            "multi-worker mode starts through run_multi_worker: forking must happen before the async runtime exists"
        );
        let bound = self.bind().await?;
        let handle = bound.handle();
        let mut serve_task = tokio::spawn(bound.serve());

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                result = &mut serve_task => return result?,
                _ = term.recv() => {
                    tracing::info!("SIGTERM received; beginning graceful shutdown");
                    handle.shutdown();
                }
                _ = int.recv() => {
                    tracing::info!("SIGINT received; beginning graceful shutdown");
                    handle.shutdown();
                }
                _ = hup.recv() => {
                    tracing::info!("SIGHUP ignored: in-place reload is not supported");
                }
            }
        }
    }

    /// Bind and run lifespan startup without installing signal handlers.
    /// The caller drives [`BoundServer::serve`] and decides when to shut
    /// down, which is what tests and embedding processes want.
    pub async fn bind(self) -> anyhow::Result<BoundServer> {
        let listener = build_listener(self.config.bind, self.config.listener_backlog, false)?;
        self.bind_on(listener, PagiInfo::single_process()).await
    }

    pub(crate) async fn bind_on(
        self,
        listener: std::net::TcpListener,
        pagi: PagiInfo,
    ) -> anyhow::Result<BoundServer> {
        let Server { config, app } = self;

        let access_log = config
            .access_log
            .as_ref()
            .map(AccessLog::open)
            .transpose()?
            .map(Arc::new);
        let tls = config
            .tls
            .as_ref()
            .map(|settings| tls::acceptor(settings, config.h2.enabled))
            .transpose()?;

        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;

        // Startup runs to completion before the first accept.
        let lifespan = Lifespan::startup(
            app.clone(),
            pagi.clone(),
            config.validate_events(),
            config.lifespan_timeout,
        )
        .await?;

        let (shutdown_tx, _) = watch::channel(Phase::Running);
        let core = Arc::new(Core {
            config,
            app,
            state: lifespan.state(),
            pagi,
            local_addr,
            access_log,
            tls,
            connections: ConnectionSet::new(),
            background: BackgroundTasks::new(),
            requests_served: AtomicU64::new(0),
            shutdown_tx,
        });

        Ok(BoundServer {
            core,
            listener,
            lifespan,
        })
    }
}

/// A server that has bound its listener and finished lifespan startup.
pub struct BoundServer {
    core: Arc<Core>,
    listener: tokio::net::TcpListener,
    lifespan: Lifespan,
}

impl BoundServer {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.core.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            core: self.core.clone(),
        }
    }

    /// Accept until shutdown is requested, then drain: stop accepting,
    /// close idle and long-lived connections, wait for in-flight requests
    /// up to `shutdown_timeout`, force-close the rest, and finally run the
    /// lifespan shutdown.
    pub async fn serve(self) -> anyhow::Result<()> {
        let BoundServer {
            core,
            listener,
            lifespan,
        } = self;
        let scheme = if core.tls.is_some() {
            Scheme::Https
        } else {
            Scheme::Http
        };
        tracing::info!(addr = %core.local_addr, scheme = %scheme, "serving");

        let mut shutdown = core.shutdown_rx();
        let mut fd_pause_logged = false;
        loop {
            if *shutdown.borrow_and_update() == Phase::Draining {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        fd_pause_logged = false;
                        let core = core.clone();
                        tokio::spawn(accept_one(core, stream, peer, scheme));
                    }
                    Err(err) if is_fd_exhaustion(&err) => {
                        // Out of descriptors: pause accepting briefly and
                        // log once per burst.
                        if !fd_pause_logged {
                            tracing::warn!(error = %err, "file descriptors exhausted; pausing accept for 100ms");
                            fd_pause_logged = true;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }

        drop(listener);
        tracing::info!(
            connections = core.connections.len(),
            "listener closed; draining connections"
        );

        let drained = tokio::time::timeout(
            core.config.shutdown_timeout,
            core.connections.wait_empty(),
        )
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                remaining = core.connections.len(),
                "drain deadline passed; force-closing remaining connections"
            );
            core.connections.force_close_all();
            let _ = tokio::time::timeout(Duration::from_secs(1), core.connections.wait_empty())
                .await;
        }

        let _ = tokio::time::timeout(core.config.lifespan_timeout, core.background.wait_idle())
            .await;
        lifespan.shutdown(core.config.lifespan_timeout).await;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// A cloneable handle for programmatic shutdown.
#[derive(Clone)]
pub struct ServerHandle {
    core: Arc<Core>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.core.begin_shutdown();
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.core.local_addr
    }

    /// Live connections right now; exposed for tests and stats.
    pub fn connection_count(&self) -> usize {
        self.core.connections.len()
    }
}

const ADMISSION_RESPONSE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
content-type: text/plain; charset=utf-8\r\n\
content-length: 19\r\n\
retry-after: 1\r\n\
connection: close\r\n\
\r\n\
Service Unavailable";

async fn accept_one(
    core: Arc<Core>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
    scheme: Scheme,
) {
    let _ = stream.set_nodelay(true);

    if core.connections.len() >= core.config.max_connections {
        tracing::warn!(
            %peer,
            limit = core.config.max_connections,
            "connection limit reached; sending 503"
        );
        admission_reject(&core, stream).await;
        return;
    }

    match &core.tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let info = tls::session_info(tls_stream.get_ref().1);
                connection::serve(core, tls_stream, peer, scheme, Some(Arc::new(info))).await;
            }
            Err(err) => {
                tracing::debug!(%peer, error = %err, "TLS handshake failed");
            }
        },
        None => connection::serve(core, stream, peer, scheme, None).await,
    }
}

/// The synthetic over-capacity response: terminate TLS if configured (the
/// client is owed a readable answer), write the canned 503, close.
async fn admission_reject(core: &Arc<Core>, stream: TcpStream) {
    match &core.tls {
        Some(acceptor) => {
            if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                let _ = tls_stream.write_all(ADMISSION_RESPONSE).await;
                let _ = tls_stream.shutdown().await;
            }
        }
        None => {
            let mut stream = stream;
            let _ = stream.write_all(ADMISSION_RESPONSE).await;
            let _ = stream.shutdown().await;
        }
    }
}

fn is_fd_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == nix::errno::Errno::EMFILE as i32
            || code == nix::errno::Errno::ENFILE as i32
    )
}

/// Worker-process serve loop: the listener is inherited (or freshly bound
/// with `SO_REUSEPORT`), SIGTERM drains, SIGINT stays ignored so only the
/// supervisor coordinates interactive interrupts.
pub(crate) async fn run_worker(
    config: ServerConfig,
    app: SharedApp,
    listener: std::net::TcpListener,
    worker_num: u32,
) -> anyhow::Result<()> {
    let server = Server { config, app };
    let bound = server
        .bind_on(listener, PagiInfo::worker(worker_num))
        .await?;
    let handle = bound.handle();
    let mut serve_task = tokio::spawn(bound.serve());

    let mut term = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            result = &mut serve_task => return result?,
            _ = term.recv() => {
                tracing::info!(worker_num, "worker received SIGTERM; draining");
                handle.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_set_removes_exactly_once() {
        let set = ConnectionSet::new();
        let a = set.register().unwrap();
        let b = set.register().unwrap();
        assert_eq!(set.len(), 2);
        drop(a);
        assert_eq!(set.len(), 1);
        drop(b);
        assert_eq!(set.len(), 0);
    }

    #[tokio::test]
    async fn force_close_reaches_registered_connections() {
        let set = ConnectionSet::new();
        let guard = set.register().unwrap();
        set.force_close_all();
        // The permit is stored even though nobody was awaiting yet.
        guard.force_closed().await;
        assert!(set.register().is_none());
    }

    #[tokio::test]
    async fn wait_empty_resolves_when_last_guard_drops() {
        let set = ConnectionSet::new();
        let guard = set.register().unwrap();
        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.wait_empty().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn background_tasks_wait_for_adopted_work() {
        let tasks = BackgroundTasks::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.adopt(Box::pin(async move {
            let _ = rx.await;
        }));
        let waiter = {
            let tasks = tasks.clone();
            tokio::spawn(async move { tasks.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        tx.send(()).unwrap();
        waiter.await.unwrap();
    }

    #[test]
    fn fd_exhaustion_is_detected() {
        let err = std::io::Error::from_raw_os_error(nix::errno::Errno::EMFILE as i32);
        assert!(is_fd_exhaustion(&err));
        let err = std::io::Error::from_raw_os_error(nix::errno::Errno::ECONNRESET as i32);
        assert!(!is_fd_exhaustion(&err));
    }
}
