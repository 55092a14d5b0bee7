use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;

use pagi_protocol::{
    AppEvent, CloseCode, ProtocolError, Receiver, Sender, ServerEvent, WebSocketScope, WsPayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsState {
    Connecting,
    Connected,
    Closed,
}

type CloseCallback = Box<dyn FnOnce(CloseCode) + Send>;

/// A convenience wrapper over a WebSocket scope's event streams.
///
/// Tracks the session state: the handshake must be completed with
/// [`accept`](Self::accept) (or rejected with [`close`](Self::close))
/// before anything can be sent.
pub struct WebSocket {
    scope: WebSocketScope,
    receive: Receiver,
    send: Sender,
    state: WsState,
    on_close: Vec<CloseCallback>,
}

impl WebSocket {
    pub fn new(scope: WebSocketScope, receive: Receiver, send: Sender) -> Self {
        Self {
            scope,
            receive,
            send,
            state: WsState::Connecting,
            on_close: Vec::new(),
        }
    }

    pub fn scope(&self) -> &WebSocketScope {
        &self.scope
    }

    /// Subprotocol names the client proposed, in order.
    pub fn subprotocols(&self) -> &[String] {
        &self.scope.subprotocols
    }

    /// Register a callback to run when the session ends.
    pub fn on_close<F>(&mut self, callback: F)
    where
        F: FnOnce(CloseCode) + Send + 'static,
    {
        self.on_close.push(Box::new(callback));
    }

    /// Complete the handshake, optionally selecting a subprotocol.
    pub async fn accept(&mut self, subprotocol: Option<&str>) -> Result<(), ProtocolError> {
        self.accept_with_headers(subprotocol, HeaderMap::new()).await
    }

    pub async fn accept_with_headers(
        &mut self,
        subprotocol: Option<&str>,
        headers: HeaderMap,
    ) -> Result<(), ProtocolError> {
        if self.state != WsState::Connecting {
            return Err(ProtocolError::InvalidEventSequence(
                "websocket already accepted or closed".into(),
            ));
        }
        // The connect event is the first thing on the stream.
        match self.receive.next().await {
            Some(ServerEvent::WebSocketConnect) => {}
            Some(other) => {
                tracing::debug!(event = other.name(), "expected websocket.connect first");
            }
            None => return Err(ProtocolError::Closed),
        }
        self.send
            .send(AppEvent::WebSocketAccept {
                subprotocol: subprotocol.map(str::to_string),
                headers,
            })
            .await?;
        self.state = WsState::Connected;
        Ok(())
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send_payload(WsPayload::Text(text.into())).await
    }

    pub async fn send_bytes(&mut self, bytes: impl Into<Bytes>) -> Result<(), ProtocolError> {
        self.send_payload(WsPayload::Binary(bytes.into())).await
    }

    pub async fn send_json<T: serde::Serialize>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let text = serde_json::to_string(value)
            .map_err(|e| ProtocolError::InvalidEventSequence(format!("json message: {e}")))?;
        self.send_text(text).await
    }

    async fn send_payload(&mut self, payload: WsPayload) -> Result<(), ProtocolError> {
        if self.state != WsState::Connected {
            return Err(ProtocolError::InvalidEventSequence(
                "send before accept (or after close)".into(),
            ));
        }
        self.send.send(AppEvent::WebSocketSend(payload)).await
    }

    /// The next message from the peer, or `None` once the session ended.
    pub async fn receive(&mut self) -> Option<WsPayload> {
        loop {
            match self.receive.next().await {
                Some(ServerEvent::WebSocketReceive(payload)) => return Some(payload),
                Some(ServerEvent::WebSocketDisconnect { code }) => {
                    self.finish(code);
                    return None;
                }
                Some(other) => {
                    tracing::debug!(event = other.name(), "unexpected event on websocket scope");
                }
                None => {
                    self.finish(CloseCode::ABNORMAL);
                    return None;
                }
            }
        }
    }

    /// [`receive`](Self::receive) with a deadline. `Ok(None)` is end of
    /// session; `Err(..)` is the timeout.
    pub async fn receive_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<WsPayload>, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.receive()).await
    }

    /// The next text message, skipping binary ones.
    pub async fn receive_text(&mut self) -> Option<String> {
        loop {
            match self.receive().await? {
                WsPayload::Text(text) => return Some(text),
                WsPayload::Binary(_) => {
                    tracing::debug!("skipping binary message while awaiting text");
                }
            }
        }
    }

    /// The next binary message, skipping text ones.
    pub async fn receive_bytes(&mut self) -> Option<Bytes> {
        loop {
            match self.receive().await? {
                WsPayload::Binary(bytes) => return Some(bytes),
                WsPayload::Text(_) => {
                    tracing::debug!("skipping text message while awaiting binary");
                }
            }
        }
    }

    /// The next text message parsed as JSON. Messages that fail to parse
    /// are skipped with a log line.
    pub async fn receive_json<T: serde::de::DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            let text = self.receive_text().await?;
            match serde_json::from_str(&text) {
                Ok(value) => return Some(value),
                Err(err) => tracing::debug!(error = %err, "skipping unparseable json message"),
            }
        }
    }

    /// Run `handler` for every text message until the session ends.
    pub async fn each_text<F, Fut>(&mut self, mut handler: F) -> Result<(), ProtocolError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<Option<String>, ProtocolError>>,
    {
        while let Some(text) = self.receive_text().await {
            if let Some(reply) = handler(text).await? {
                self.send_text(reply).await?;
            }
        }
        Ok(())
    }

    /// Run `handler` for every binary message until the session ends.
    pub async fn each_bytes<F, Fut>(&mut self, mut handler: F) -> Result<(), ProtocolError>
    where
        F: FnMut(Bytes) -> Fut,
        Fut: std::future::Future<Output = Result<Option<Bytes>, ProtocolError>>,
    {
        while let Some(bytes) = self.receive_bytes().await {
            if let Some(reply) = handler(bytes).await? {
                self.send_bytes(reply).await?;
            }
        }
        Ok(())
    }

    /// Close the session (or reject the handshake when not yet accepted).
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), ProtocolError> {
        if self.state == WsState::Closed {
            return Ok(());
        }
        if self.state == WsState::Connecting {
            // Rejection: consume the pending connect event first.
            let _ = self.receive.next().await;
        }
        self.send
            .send(AppEvent::WebSocketClose {
                code,
                reason: reason.to_string(),
            })
            .await?;
        self.finish(code);
        Ok(())
    }

    fn finish(&mut self, code: CloseCode) {
        if self.state == WsState::Closed {
            return;
        }
        self.state = WsState::Closed;
        for callback in self.on_close.drain(..) {
            callback(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method, Version};
    use pagi_protocol::{
        app_channel, server_channel, PagiInfo, PathParams, RequestScope, Scheme, Stash, State,
        Tasks,
    };
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;

    fn ws_scope() -> WebSocketScope {
        WebSocketScope {
            request: RequestScope {
                method: Method::GET,
                path: "/ws".into(),
                raw_path: Bytes::from_static(b"/ws"),
                query_string: Bytes::new(),
                headers: HeaderMap::new(),
                scheme: Scheme::Http,
                http_version: Version::HTTP_11,
                client: "127.0.0.1:4000".parse().unwrap(),
                server: "127.0.0.1:80".parse().unwrap(),
                tls: None,
                root_path: String::new(),
                pagi: PagiInfo::single_process(),
                state: State::new(),
                stash: Stash::new(),
                tasks: Tasks::disconnected(),
                path_params: PathParams::new(),
                route: None,
            },
            subprotocols: vec!["chat".into()],
        }
    }

    #[tokio::test]
    async fn send_before_accept_is_refused() {
        let (_queue, receiver) = server_channel(4);
        let (sender, _events) = app_channel(4, None);
        let mut ws = WebSocket::new(ws_scope(), receiver, sender);
        assert!(ws.send_text("nope").await.is_err());
    }

    #[tokio::test]
    async fn echo_flow() {
        let (queue, receiver) = server_channel(8);
        let (sender, mut events) = app_channel(8, None);
        let mut ws = WebSocket::new(ws_scope(), receiver, sender);

        queue.push(ServerEvent::WebSocketConnect).await;
        ws.accept(Some("chat")).await.unwrap();
        match events.next().await {
            Some(AppEvent::WebSocketAccept { subprotocol, .. }) => {
                assert_eq!(subprotocol.as_deref(), Some("chat"));
            }
            other => panic!("unexpected {other:?}"),
        }

        queue
            .push(ServerEvent::WebSocketReceive(WsPayload::Text("hi".into())))
            .await;
        let text = ws.receive_text().await.unwrap();
        ws.send_text(format!("Echo: {text}")).await.unwrap();
        match events.next().await {
            Some(AppEvent::WebSocketSend(WsPayload::Text(t))) => assert_eq!(t, "Echo: hi"),
            other => panic!("unexpected {other:?}"),
        }

        queue
            .push(ServerEvent::WebSocketDisconnect {
                code: CloseCode::NORMAL,
            })
            .await;
        assert!(ws.receive().await.is_none());
    }

    #[tokio::test]
    async fn on_close_runs_once_with_the_code() {
        let (queue, receiver) = server_channel(8);
        let (sender, _events) = app_channel(8, None);
        let mut ws = WebSocket::new(ws_scope(), receiver, sender);
        let seen = Arc::new(AtomicU16::new(0));
        {
            let seen = seen.clone();
            ws.on_close(move |code| {
                seen.store(code.0, Ordering::SeqCst);
            });
        }
        queue.push(ServerEvent::WebSocketConnect).await;
        ws.accept(None).await.unwrap();
        queue
            .push(ServerEvent::WebSocketDisconnect {
                code: CloseCode::POLICY_VIOLATION,
            })
            .await;
        assert!(ws.receive().await.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1008);
    }

    #[tokio::test]
    async fn receive_timeout_elapses() {
        let (_queue, receiver) = server_channel(4);
        let (sender, _events) = app_channel(4, None);
        let mut ws = WebSocket::new(ws_scope(), receiver, sender);
        ws.state = WsState::Connected;
        assert!(ws
            .receive_timeout(Duration::from_millis(10))
            .await
            .is_err());
    }
}
