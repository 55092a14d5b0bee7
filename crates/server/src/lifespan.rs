//! The lifespan manager.
//!
//! Runs startup once per process (or per worker) before the listener starts
//! accepting, owns the shared [`State`] handed to every subsequent scope,
//! and runs shutdown after the graceful drain. An application that does not
//! understand the lifespan scope is tolerated: the server logs it and
//! proceeds with an empty state.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;

use pagi_protocol::{
    app_channel, server_channel, validating_sender, AppError, AppEvent, AppEventQueue,
    Application, LifespanScope, PagiInfo, Receiver, Scope, ScopeKind, Sender, ServerEvent,
    ServerEventQueue, SharedApp, State,
};

#[derive(Debug, thiserror::Error)]
pub enum LifespanError {
    /// The application reported a startup failure. In single-process mode
    /// the server refuses to start; a worker exits with code 2 and is not
    /// respawned.
    #[error("lifespan startup failed: {0}")]
    StartupFailed(String),
    #[error("lifespan startup did not complete within {0:?}")]
    StartupTimeout(Duration),
}

/// A live lifespan session: the state it populated plus the channels kept
/// open for the shutdown phase.
pub struct Lifespan {
    state: State,
    supported: bool,
    queue: ServerEventQueue,
    events: AppEventQueue,
    task: Option<JoinHandle<Result<(), AppError>>>,
}

impl std::fmt::Debug for Lifespan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifespan")
            .field("supported", &self.supported)
            .finish_non_exhaustive()
    }
}

impl Lifespan {
    pub fn state(&self) -> State {
        self.state.clone()
    }

    pub fn supported(&self) -> bool {
        self.supported
    }

    /// Run the startup phase to completion.
    pub async fn startup(
        app: SharedApp,
        pagi: PagiInfo,
        validate_events: bool,
        timeout: Duration,
    ) -> Result<Lifespan, LifespanError> {
        let state = State::new();
        let scope = Scope::Lifespan(LifespanScope {
            pagi,
            state: state.clone(),
        });
        let (queue, receiver) = server_channel(4);
        let (sender, mut events) = app_channel(4, None);
        let sender = if validate_events {
            validating_sender(ScopeKind::Lifespan, sender)
        } else {
            sender
        };

        let task = tokio::spawn(async move { app.call(scope, receiver, sender).await });
        queue.push(ServerEvent::LifespanStartup).await;

        let mut lifespan = Lifespan {
            state,
            supported: false,
            queue,
            events: AppEventQueue::closed(),
            task: None,
        };

        match tokio::time::timeout(timeout, events.next()).await {
            Err(_) => {
                task.abort();
                return Err(LifespanError::StartupTimeout(timeout));
            }
            Ok(Some(AppEvent::StartupComplete)) => {
                tracing::debug!("lifespan startup complete");
                lifespan.supported = true;
                lifespan.events = events;
                lifespan.task = Some(task);
            }
            Ok(Some(AppEvent::StartupFailed { message })) => {
                task.abort();
                return Err(LifespanError::StartupFailed(message));
            }
            Ok(Some(other)) => {
                // Anything else before a startup reply is a confused
                // application; degrade the same way as "unsupported".
                tracing::debug!(event = other.name(), "unexpected lifespan event; degrading");
                lifespan.log_unsupported(task).await;
            }
            Ok(None) => {
                lifespan.log_unsupported(task).await;
            }
        }
        Ok(lifespan)
    }

    async fn log_unsupported(&mut self, task: JoinHandle<Result<(), AppError>>) {
        // The application gets no further lifespan events; a handler that is
        // still running at this point is not going to produce one either.
        task.abort();
        match task.await {
            Ok(Err(AppError::Unsupported)) => {
                tracing::info!("lifespan unsupported by application; continuing with empty state");
            }
            Ok(Err(err)) => {
                tracing::info!(
                    error = %err,
                    "application failed on the lifespan scope; treating lifespan as unsupported"
                );
            }
            Ok(Ok(())) => {
                tracing::debug!("application ignored the lifespan scope; no startup reply");
            }
            Err(_) => {
                tracing::info!(
                    "application never replied on the lifespan scope; treating lifespan as unsupported"
                );
            }
        }
        self.supported = false;
    }

    /// Run the shutdown phase. Failures are logged; the process still exits.
    pub async fn shutdown(mut self, timeout: Duration) {
        if !self.supported {
            return;
        }
        if !self.queue.push(ServerEvent::LifespanShutdown).await {
            tracing::debug!("lifespan application already gone at shutdown");
            return;
        }
        match tokio::time::timeout(timeout, self.events.next()).await {
            Ok(Some(AppEvent::ShutdownComplete)) => {
                tracing::debug!("lifespan shutdown complete");
            }
            Ok(Some(AppEvent::ShutdownFailed { message })) => {
                tracing::warn!(message = %message, "lifespan shutdown failed");
            }
            Ok(Some(other)) => {
                tracing::debug!(event = other.name(), "unexpected event during lifespan shutdown");
            }
            Ok(None) => {
                tracing::warn!("lifespan application exited without a shutdown reply");
            }
            Err(_) => {
                tracing::warn!(?timeout, "lifespan shutdown timed out");
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

type Hook = Arc<dyn Fn(State) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Stacks startup/shutdown hooks around an application.
///
/// Hooks registered here run before the inner application's own lifespan
/// handling on startup, and after it on shutdown; nesting wrappers therefore
/// runs startups outer-to-inner and shutdowns inner-to-outer, accumulating
/// into the one shared state.
pub struct LifespanHooks {
    inner: SharedApp,
    on_startup: Vec<Hook>,
    on_shutdown: Vec<Hook>,
}

impl LifespanHooks {
    pub fn new(inner: impl Application) -> Self {
        Self {
            inner: Arc::new(inner),
            on_startup: Vec::new(),
            on_shutdown: Vec::new(),
        }
    }

    pub fn wrap(inner: SharedApp) -> Self {
        Self {
            inner,
            on_startup: Vec::new(),
            on_shutdown: Vec::new(),
        }
    }

    pub fn on_startup<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_startup.push(Arc::new(move |state| hook(state).boxed()));
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_shutdown.push(Arc::new(move |state| hook(state).boxed()));
        self
    }

    async fn run_lifespan(
        &self,
        scope: LifespanScope,
        receive: Receiver,
        send: Sender,
    ) -> Result<(), AppError> {
        let state = scope.state.clone();
        let mut inner_session: Option<(ServerEventQueue, AppEventQueue)> = None;

        while let Some(event) = receive.next().await {
            match event {
                ServerEvent::LifespanStartup => {
                    for hook in &self.on_startup {
                        if let Err(err) = hook(state.clone()).await {
                            send.send(AppEvent::StartupFailed {
                                message: err.to_string(),
                            })
                            .await?;
                            return Ok(());
                        }
                    }

                    // Delegate to the inner application; tolerate it not
                    // handling lifespan at all.
                    let (iqueue, ireceiver) = server_channel(4);
                    let (isender, mut ievents) = app_channel(4, None);
                    let inner = self.inner.clone();
                    let inner_scope = Scope::Lifespan(scope.clone());
                    tokio::spawn(async move { inner.call(inner_scope, ireceiver, isender).await });
                    iqueue.push(ServerEvent::LifespanStartup).await;
                    match ievents.next().await {
                        Some(AppEvent::StartupComplete) => {
                            inner_session = Some((iqueue, ievents));
                            send.send(AppEvent::StartupComplete).await?;
                        }
                        Some(AppEvent::StartupFailed { message }) => {
                            send.send(AppEvent::StartupFailed { message }).await?;
                            return Ok(());
                        }
                        _ => {
                            send.send(AppEvent::StartupComplete).await?;
                        }
                    }
                }
                ServerEvent::LifespanShutdown => {
                    let mut failure: Option<String> = None;
                    if let Some((iqueue, mut ievents)) = inner_session.take() {
                        if iqueue.push(ServerEvent::LifespanShutdown).await {
                            match ievents.next().await {
                                Some(AppEvent::ShutdownComplete) | None => {}
                                Some(AppEvent::ShutdownFailed { message }) => {
                                    failure = Some(message);
                                }
                                Some(other) => {
                                    tracing::debug!(
                                        event = other.name(),
                                        "unexpected inner lifespan event"
                                    );
                                }
                            }
                        }
                    }
                    for hook in self.on_shutdown.iter().rev() {
                        if let Err(err) = hook(state.clone()).await {
                            failure.get_or_insert_with(|| err.to_string());
                        }
                    }
                    match failure {
                        Some(message) => {
                            send.send(AppEvent::ShutdownFailed { message }).await?
                        }
                        None => send.send(AppEvent::ShutdownComplete).await?,
                    }
                    return Ok(());
                }
                other => {
                    tracing::debug!(event = other.name(), "unexpected event on lifespan scope");
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Application for LifespanHooks {
    async fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> Result<(), AppError> {
        match scope {
            Scope::Lifespan(lifespan) => self.run_lifespan(lifespan, receive, send).await,
            other => self.inner.call(other, receive, send).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn unsupported_app() -> SharedApp {
        Arc::new(|scope: Scope, _: Receiver, _: Sender| async move {
            match scope {
                Scope::Lifespan(_) => Err(AppError::Unsupported),
                _ => Ok(()),
            }
        })
    }

    fn supported_app() -> SharedApp {
        Arc::new(|_: Scope, receive: Receiver, send: Sender| async move {
            while let Some(event) = receive.next().await {
                match event {
                    ServerEvent::LifespanStartup => {
                        send.send(AppEvent::StartupComplete).await?;
                    }
                    ServerEvent::LifespanShutdown => {
                        send.send(AppEvent::ShutdownComplete).await?;
                        break;
                    }
                    _ => {}
                }
            }
            Ok(())
        })
    }

    #[tokio::test]
    async fn unsupported_application_is_tolerated() {
        let lifespan = Lifespan::startup(
            unsupported_app(),
            PagiInfo::single_process(),
            false,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(!lifespan.supported());
        assert!(lifespan.state().is_empty());
        lifespan.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn startup_failure_is_distinguished() {
        let app: SharedApp = Arc::new(|_: Scope, receive: Receiver, send: Sender| async move {
            if let Some(ServerEvent::LifespanStartup) = receive.next().await {
                send.send(AppEvent::StartupFailed {
                    message: "no database".into(),
                })
                .await?;
            }
            Ok(())
        });
        let err = Lifespan::startup(
            app,
            PagiInfo::single_process(),
            false,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LifespanError::StartupFailed(m) if m == "no database"));
    }

    #[tokio::test]
    async fn full_cycle_with_supported_app() {
        let lifespan = Lifespan::startup(
            supported_app(),
            PagiInfo::worker(1),
            true,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(lifespan.supported());
        lifespan.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn hooks_stack_outer_to_inner_and_reverse() {
        let order = Arc::new(Mutex::new(Vec::<String>::new()));

        let push = |order: &Arc<Mutex<Vec<String>>>, label: &'static str| {
            let order = order.clone();
            move |_state: State| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(label.to_string());
                    Ok(())
                }
            }
        };

        let inner = LifespanHooks::new(unsupported_app())
            .on_startup(push(&order, "inner-up"))
            .on_shutdown(push(&order, "inner-down"));
        let outer = LifespanHooks::new(inner)
            .on_startup(push(&order, "outer-up"))
            .on_shutdown(push(&order, "outer-down"));

        let lifespan = Lifespan::startup(
            Arc::new(outer),
            PagiInfo::single_process(),
            true,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(lifespan.supported());
        lifespan.shutdown(Duration::from_secs(1)).await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-up", "inner-up", "inner-down", "outer-down"]
        );
    }

    #[tokio::test]
    async fn startup_hook_failure_reports_failed() {
        let app = LifespanHooks::new(unsupported_app())
            .on_startup(|_state| async { anyhow::bail!("resource missing") });
        let err = Lifespan::startup(
            Arc::new(app),
            PagiInfo::single_process(),
            false,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LifespanError::StartupFailed(_)));
    }
}
