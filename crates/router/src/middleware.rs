//! Middleware chain composition.
//!
//! Chains are folded once at finalize time into a single application value,
//! so dispatch is a direct call with no per-request allocation.

use std::sync::Arc;

use async_trait::async_trait;

use pagi_protocol::{
    AppError, Application, Next, Receiver, Scope, Sender, SharedApp, SharedMiddleware,
};

struct Layered {
    middleware: SharedMiddleware,
    next: Next,
}

#[async_trait]
impl Application for Layered {
    async fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> Result<(), AppError> {
        self.middleware
            .call(scope, receive, send, self.next.clone())
            .await
    }
}

/// Wrap `handler` in `middleware`, outermost first.
pub fn compose(middleware: &[SharedMiddleware], handler: SharedApp) -> SharedApp {
    middleware.iter().rev().fold(handler, |inner, mw| {
        Arc::new(Layered {
            middleware: mw.clone(),
            next: Next::new(inner),
        }) as SharedApp
    })
}
