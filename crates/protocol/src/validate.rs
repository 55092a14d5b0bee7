//! Development-mode event-sequence validation.
//!
//! When enabled, the application-facing sender is wrapped in a per-scope
//! automaton that rejects out-of-order events with
//! [`ProtocolError::InvalidEventSequence`] instead of leaving the behavior
//! undefined. Off by default; costs nothing when off.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::channel::{EventSink, Sender};
use crate::events::{AppEvent, ProtocolError, ScopeKind};

#[derive(Default)]
struct SeqState {
    // http / sse
    started: bool,
    body_finished: bool,
    // websocket
    accepted: bool,
    closed: bool,
    // lifespan
    startup_replied: bool,
    shutdown_replied: bool,
}

struct ValidatingSink {
    kind: ScopeKind,
    state: Mutex<SeqState>,
    inner: Sender,
}

impl ValidatingSink {
    fn check(&self, event: &AppEvent) -> Result<(), ProtocolError> {
        if event.scope_kind() != self.kind {
            return Err(ProtocolError::IllegalEvent {
                event: event.name(),
                scope: self.kind,
            });
        }

        let mut s = self.state.lock().unwrap();
        let fail = |detail: String| Err(ProtocolError::InvalidEventSequence(detail));
        match event {
            AppEvent::ResponseStart { .. } => {
                if s.started {
                    return fail("http.response.start sent twice".into());
                }
                s.started = true;
            }
            AppEvent::ResponseBody { more, .. } => {
                if !s.started {
                    return fail("http.response.body before http.response.start".into());
                }
                if s.body_finished {
                    return fail("http.response.body after the final body event".into());
                }
                if !more {
                    s.body_finished = true;
                }
            }
            AppEvent::ResponseTrailers { .. } => {
                if !s.started {
                    return fail("http.response.trailers before http.response.start".into());
                }
            }
            AppEvent::WebSocketAccept { .. } => {
                if s.accepted {
                    return fail("websocket.accept sent twice".into());
                }
                if s.closed {
                    return fail("websocket.accept after websocket.close".into());
                }
                s.accepted = true;
            }
            AppEvent::WebSocketSend(_) => {
                if !s.accepted {
                    return fail("websocket.send before websocket.accept".into());
                }
                if s.closed {
                    return fail("websocket.send after websocket.close".into());
                }
            }
            AppEvent::WebSocketClose { .. } => {
                if s.closed {
                    return fail("websocket.close sent twice".into());
                }
                s.closed = true;
            }
            AppEvent::SseStart { .. } => {
                if s.started {
                    return fail("sse.response.start sent twice".into());
                }
                s.started = true;
            }
            AppEvent::SseEvent(frame) => {
                if !s.started {
                    return fail("sse.response.body before sse.response.start".into());
                }
                if s.body_finished {
                    return fail("sse.response.body after the final event".into());
                }
                if !frame.more {
                    s.body_finished = true;
                }
            }
            AppEvent::StartupComplete | AppEvent::StartupFailed { .. } => {
                if s.startup_replied {
                    return fail("lifespan startup replied to twice".into());
                }
                s.startup_replied = true;
            }
            AppEvent::ShutdownComplete | AppEvent::ShutdownFailed { .. } => {
                if !s.startup_replied {
                    return fail("lifespan shutdown reply before startup reply".into());
                }
                if s.shutdown_replied {
                    return fail("lifespan shutdown replied to twice".into());
                }
                s.shutdown_replied = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for ValidatingSink {
    async fn send(&self, event: AppEvent) -> Result<(), ProtocolError> {
        self.check(&event)?;
        self.inner.send(event).await
    }
}

/// Wrap `inner` in the sequence validator for the given scope kind.
pub fn validating_sender(kind: ScopeKind, inner: Sender) -> Sender {
    Sender::from_sink(Arc::new(ValidatingSink {
        kind,
        state: Mutex::new(SeqState::default()),
        inner,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::app_channel;
    use crate::events::{BodyPayload, WsPayload};
    use http::{HeaderMap, StatusCode};

    fn start() -> AppEvent {
        AppEvent::ResponseStart {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            trailers: false,
        }
    }

    fn body(more: bool) -> AppEvent {
        AppEvent::ResponseBody {
            payload: BodyPayload::from("x"),
            more,
        }
    }

    #[tokio::test]
    async fn body_before_start_is_rejected() {
        let (inner, _queue) = app_channel(8, None);
        let sender = validating_sender(ScopeKind::Http, inner);
        let err = sender.send(body(false)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEventSequence(_)));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (inner, _queue) = app_channel(8, None);
        let sender = validating_sender(ScopeKind::Http, inner);
        sender.send(start()).await.unwrap();
        assert!(sender.send(start()).await.is_err());
    }

    #[tokio::test]
    async fn body_after_final_event_is_rejected() {
        let (inner, _queue) = app_channel(8, None);
        let sender = validating_sender(ScopeKind::Http, inner);
        sender.send(start()).await.unwrap();
        sender.send(body(true)).await.unwrap();
        sender.send(body(false)).await.unwrap();
        assert!(sender.send(body(false)).await.is_err());
    }

    #[tokio::test]
    async fn ws_send_requires_accept() {
        let (inner, _queue) = app_channel(8, None);
        let sender = validating_sender(ScopeKind::WebSocket, inner);
        let err = sender
            .send(AppEvent::WebSocketSend(WsPayload::Text("hi".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEventSequence(_)));

        sender
            .send(AppEvent::WebSocketAccept {
                subprotocol: None,
                headers: HeaderMap::new(),
            })
            .await
            .unwrap();
        sender
            .send(AppEvent::WebSocketSend(WsPayload::Text("hi".into())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cross_scope_event_is_illegal() {
        let (inner, _queue) = app_channel(8, None);
        let sender = validating_sender(ScopeKind::Http, inner);
        let err = sender.send(AppEvent::StartupComplete).await.unwrap_err();
        assert!(matches!(err, ProtocolError::IllegalEvent { .. }));
    }

    #[tokio::test]
    async fn lifespan_replies_must_be_ordered() {
        let (inner, _queue) = app_channel(8, None);
        let sender = validating_sender(ScopeKind::Lifespan, inner);
        assert!(sender.send(AppEvent::ShutdownComplete).await.is_err());
        sender.send(AppEvent::StartupComplete).await.unwrap();
        sender.send(AppEvent::ShutdownComplete).await.unwrap();
        assert!(sender.send(AppEvent::ShutdownComplete).await.is_err());
    }
}
