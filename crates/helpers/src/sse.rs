use std::time::Duration;

use http::HeaderMap;

use pagi_protocol::{AppEvent, ProtocolError, Receiver, Sender, ServerEvent, SseFrame};

/// A convenience wrapper over an SSE scope's event streams.
///
/// With a keepalive interval set, a comment frame is emitted whenever the
/// stream has been quiet for that long, so proxies and clients see the
/// connection is alive. Keepalives are whole frames and never split an
/// application event.
pub struct Sse {
    receive: Receiver,
    send: Sender,
    started: bool,
    keepalive: Option<Duration>,
    keepalive_task: Option<tokio::task::JoinHandle<()>>,
}

impl Sse {
    pub fn new(receive: Receiver, send: Sender) -> Self {
        Self {
            receive,
            send,
            started: false,
            keepalive: None,
            keepalive_task: None,
        }
    }

    /// Set the keepalive interval. Takes effect at [`start`](Self::start).
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    /// Open the event stream.
    pub async fn start(&mut self) -> Result<(), ProtocolError> {
        self.start_with_headers(HeaderMap::new()).await
    }

    pub async fn start_with_headers(&mut self, headers: HeaderMap) -> Result<(), ProtocolError> {
        if self.started {
            return Err(ProtocolError::InvalidEventSequence(
                "sse stream already started".into(),
            ));
        }
        self.send.send(AppEvent::SseStart { headers }).await?;
        self.started = true;

        if let Some(interval) = self.keepalive {
            let send = self.send.clone();
            self.keepalive_task = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let frame = SseFrame::comment("keepalive");
                    if send.send(AppEvent::SseEvent(frame)).await.is_err() {
                        return;
                    }
                }
            }));
        }
        Ok(())
    }

    /// Emit one event with a data payload.
    pub async fn send_event(&mut self, data: impl Into<String>) -> Result<(), ProtocolError> {
        self.send_frame(SseFrame::data(data)).await
    }

    /// Emit one fully-specified frame.
    pub async fn send_frame(&mut self, frame: SseFrame) -> Result<(), ProtocolError> {
        if !self.started {
            return Err(ProtocolError::InvalidEventSequence(
                "sse event before start".into(),
            ));
        }
        self.bump_keepalive();
        self.send.send(AppEvent::SseEvent(frame)).await
    }

    /// Emit an event whose data is `value` serialized as JSON.
    pub async fn send_json<T: serde::Serialize>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let data = serde_json::to_string(value)
            .map_err(|e| ProtocolError::InvalidEventSequence(format!("json event: {e}")))?;
        self.send_event(data).await
    }

    /// Emit a comment-only frame.
    pub async fn send_comment(&mut self, comment: impl Into<String>) -> Result<(), ProtocolError> {
        self.send_frame(SseFrame::comment(comment)).await
    }

    /// Park until the client goes away.
    pub async fn wait_for_disconnect(&mut self) {
        loop {
            match self.receive.next().await {
                Some(ServerEvent::SseDisconnect) | None => return,
                Some(other) => {
                    tracing::debug!(event = other.name(), "unexpected event on sse scope");
                }
            }
        }
    }

    /// End the stream.
    pub async fn end(mut self) -> Result<(), ProtocolError> {
        self.stop_keepalive();
        if !self.started {
            return Ok(());
        }
        self.send
            .send(AppEvent::SseEvent(SseFrame {
                more: false,
                ..SseFrame::default()
            }))
            .await
    }

    fn bump_keepalive(&mut self) {
        // Restart the quiet-period timer: an application event counts as
        // liveness on its own.
        if let (Some(interval), Some(task)) = (self.keepalive, self.keepalive_task.take()) {
            task.abort();
            let send = self.send.clone();
            self.keepalive_task = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let frame = SseFrame::comment("keepalive");
                    if send.send(AppEvent::SseEvent(frame)).await.is_err() {
                        return;
                    }
                }
            }));
        }
    }

    fn stop_keepalive(&mut self) {
        if let Some(task) = self.keepalive_task.take() {
            task.abort();
        }
    }
}

impl Drop for Sse {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagi_protocol::{app_channel, server_channel};

    #[tokio::test]
    async fn event_before_start_is_refused() {
        let (_queue, receiver) = server_channel(4);
        let (sender, _events) = app_channel(4, None);
        let mut sse = Sse::new(receiver, sender);
        assert!(sse.send_event("tick").await.is_err());
    }

    #[tokio::test]
    async fn start_then_events_then_end() {
        let (_queue, receiver) = server_channel(4);
        let (sender, mut events) = app_channel(16, None);
        let mut sse = Sse::new(receiver, sender);
        sse.start().await.unwrap();
        sse.send_event("one").await.unwrap();
        sse.send_json(&serde_json::json!({"n": 2})).await.unwrap();
        sse.end().await.unwrap();

        assert!(matches!(events.next().await, Some(AppEvent::SseStart { .. })));
        match events.next().await {
            Some(AppEvent::SseEvent(frame)) => {
                assert_eq!(frame.data.as_deref(), Some("one"));
                assert!(frame.more);
            }
            other => panic!("unexpected {other:?}"),
        }
        match events.next().await {
            Some(AppEvent::SseEvent(frame)) => {
                assert_eq!(frame.data.as_deref(), Some(r#"{"n":2}"#));
            }
            other => panic!("unexpected {other:?}"),
        }
        match events.next().await {
            Some(AppEvent::SseEvent(frame)) => assert!(!frame.more),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn keepalive_emits_comment_frames_when_quiet() {
        tokio::time::pause();
        let (_queue, receiver) = server_channel(4);
        let (sender, mut events) = app_channel(16, None);
        let mut sse = Sse::new(receiver, sender).keepalive(Duration::from_secs(15));
        sse.start().await.unwrap();
        assert!(matches!(events.next().await, Some(AppEvent::SseStart { .. })));

        tokio::time::advance(Duration::from_secs(16)).await;
        match events.next().await {
            Some(AppEvent::SseEvent(frame)) => {
                assert!(frame.comment.is_some());
                assert!(frame.data.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        sse.end().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_disconnect_returns_on_event() {
        let (queue, receiver) = server_channel(4);
        let (sender, _events) = app_channel(4, None);
        let mut sse = Sse::new(receiver, sender);
        queue.push(ServerEvent::SseDisconnect).await;
        sse.wait_for_disconnect().await;
    }
}
