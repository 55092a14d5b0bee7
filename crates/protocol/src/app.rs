use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{Receiver, Sender};
use crate::events::ProtocolError;
use crate::scope::Scope;

/// Why an application call ended without a normal completion.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The application does not understand this scope kind.
    ///
    /// For lifespan scopes the server tolerates this and proceeds with an
    /// empty state; for request scopes it produces a 500-equivalent.
    #[error("scope type not supported by this application")]
    Unsupported,
    /// An event could not be delivered, usually because the peer went away.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The application itself failed.
    #[error(transparent)]
    Failure(#[from] anyhow::Error),
}

/// A PAGI application: any callable of shape `(scope, receive, send)`.
///
/// The call returns when the scope is terminal: response fully sent for
/// HTTP, session closed for WebSocket/SSE, shutdown complete for lifespan.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> Result<(), AppError>;
}

/// A shared, type-erased application.
pub type SharedApp = Arc<dyn Application>;

#[async_trait]
impl Application for SharedApp {
    async fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> Result<(), AppError> {
        self.as_ref().call(scope, receive, send).await
    }
}

#[async_trait]
impl<F, Fut> Application for F
where
    F: Fn(Scope, Receiver, Sender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AppError>> + Send + 'static,
{
    async fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> Result<(), AppError> {
        (self)(scope, receive, send).await
    }
}

/// The continuation a middleware invokes to run the rest of its chain.
#[derive(Clone)]
pub struct Next {
    app: SharedApp,
}

impl Next {
    pub fn new(app: SharedApp) -> Self {
        Self { app }
    }

    pub async fn run(
        &self,
        scope: Scope,
        receive: Receiver,
        send: Sender,
    ) -> Result<(), AppError> {
        self.app.call(scope, receive, send).await
    }
}

/// One layer of the onion: observes or modifies the scope and either calls
/// `next` or short-circuits with a complete event sequence of its own.
///
/// A middleware that wraps `send` must forward events in order; one that
/// wraps `receive` observes incoming events without reordering them.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn call(
        &self,
        scope: Scope,
        receive: Receiver,
        send: Sender,
        next: Next,
    ) -> Result<(), AppError>;
}

/// A shared, type-erased middleware.
pub type SharedMiddleware = Arc<dyn Middleware>;

#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Scope, Receiver, Sender, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AppError>> + Send + 'static,
{
    async fn call(
        &self,
        scope: Scope,
        receive: Receiver,
        send: Sender,
        next: Next,
    ) -> Result<(), AppError> {
        (self)(scope, receive, send, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{app_channel, server_channel};
    use crate::events::AppEvent;
    use crate::scope::{LifespanScope, PagiInfo};
    use crate::state::State;
    use http::StatusCode;

    fn lifespan_scope() -> Scope {
        Scope::Lifespan(LifespanScope {
            pagi: PagiInfo::single_process(),
            state: State::new(),
        })
    }

    #[tokio::test]
    async fn closures_are_applications() {
        let app: SharedApp = Arc::new(
            |_scope: Scope, _receive: Receiver, send: Sender| async move {
                send.send(AppEvent::StartupComplete).await?;
                Ok(())
            },
        );

        let (_queue, receiver) = server_channel(1);
        let (sender, mut events) = app_channel(1, None);
        app.call(lifespan_scope(), receiver, sender).await.unwrap();
        assert!(matches!(events.next().await, Some(AppEvent::StartupComplete)));
    }

    #[tokio::test]
    async fn middleware_short_circuits_without_calling_next() {
        let inner: SharedApp = Arc::new(
            |_: Scope, _: Receiver, _: Sender| async move { panic!("must not be reached") },
        );
        let mw: SharedMiddleware = Arc::new(
            |_scope: Scope, _receive: Receiver, send: Sender, _next: Next| async move {
                send.send(AppEvent::ResponseStart {
                    status: StatusCode::FORBIDDEN,
                    headers: Default::default(),
                    trailers: false,
                })
                .await?;
                Ok(())
            },
        );

        let (_queue, receiver) = server_channel(1);
        let (sender, mut events) = app_channel(2, None);
        mw.call(lifespan_scope(), receiver, sender, Next::new(inner))
            .await
            .unwrap();
        match events.next().await {
            Some(AppEvent::ResponseStart { status, .. }) => {
                assert_eq!(status, StatusCode::FORBIDDEN)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
