use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::events::{AppEvent, ProtocolError, ServerEvent};

/// An asynchronous source of server events, as seen by the application.
///
/// Middleware that needs to observe or transform incoming events implements
/// this trait around an inner [`Receiver`].
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// The next event, or `None` once the scope is terminal.
    async fn next(&self) -> Option<ServerEvent>;
}

/// An asynchronous sink for application events, as seen by the application.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn send(&self, event: AppEvent) -> Result<(), ProtocolError>;
}

/// The `receive` half handed to an application.
#[derive(Clone)]
pub struct Receiver {
    source: Arc<dyn EventSource>,
}

impl Receiver {
    pub fn from_source(source: Arc<dyn EventSource>) -> Self {
        Self { source }
    }

    pub async fn next(&self) -> Option<ServerEvent> {
        self.source.next().await
    }

    /// A receiver that observes each event as it passes through.
    pub fn inspect<F>(self, f: F) -> Receiver
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        struct Inspect<F> {
            inner: Receiver,
            f: F,
        }

        #[async_trait]
        impl<F> EventSource for Inspect<F>
        where
            F: Fn(&ServerEvent) + Send + Sync + 'static,
        {
            async fn next(&self) -> Option<ServerEvent> {
                let event = self.inner.next().await;
                if let Some(ev) = &event {
                    (self.f)(ev);
                }
                event
            }
        }

        Receiver::from_source(Arc::new(Inspect { inner: self, f }))
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

/// The `send` half handed to an application.
#[derive(Clone)]
pub struct Sender {
    sink: Arc<dyn EventSink>,
}

impl Sender {
    pub fn from_sink(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub async fn send(&self, event: AppEvent) -> Result<(), ProtocolError> {
        self.sink.send(event).await
    }

    /// A sender that observes each event before forwarding it.
    pub fn inspect<F>(self, f: F) -> Sender
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        struct Inspect<F> {
            inner: Sender,
            f: F,
        }

        #[async_trait]
        impl<F> EventSink for Inspect<F>
        where
            F: Fn(&AppEvent) + Send + Sync + 'static,
        {
            async fn send(&self, event: AppEvent) -> Result<(), ProtocolError> {
                (self.f)(&event);
                self.inner.send(event).await
            }
        }

        Sender::from_sink(Arc::new(Inspect { inner: self, f }))
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

/// Byte-counted writer backpressure.
///
/// The connection writer credits bytes as they reach the transport; the
/// application-facing sink debits them as events are queued. Once the queue
/// exceeds the high watermark, debits suspend until drain brings it back
/// under the low watermark.
pub struct WriteBudget {
    high: usize,
    low: usize,
    state: Mutex<BudgetState>,
    drained: Notify,
}

#[derive(Default)]
struct BudgetState {
    queued: usize,
    suspended: bool,
}

impl WriteBudget {
    pub fn new(high: usize, low: usize) -> Arc<Self> {
        debug_assert!(low <= high);
        Arc::new(Self {
            high,
            low,
            state: Mutex::new(BudgetState::default()),
            drained: Notify::new(),
        })
    }

    /// Account `n` queued bytes, suspending while the writer is over the
    /// high watermark.
    pub async fn debit(&self, n: usize) {
        loop {
            let drained = self.drained.notified();
            {
                let mut state = self.state.lock().unwrap();
                if !state.suspended {
                    state.queued += n;
                    if state.queued > self.high {
                        state.suspended = true;
                    }
                    return;
                }
            }
            drained.await;
        }
    }

    /// Account `n` bytes written to the transport.
    pub fn credit(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.queued = state.queued.saturating_sub(n);
        if state.suspended && state.queued < self.low {
            state.suspended = false;
            drop(state);
            self.drained.notify_waiters();
        }
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queued
    }
}

/// Bytes an event occupies in the write queue before the transport takes it.
fn event_cost(event: &AppEvent) -> usize {
    match event {
        AppEvent::ResponseBody { payload, .. } => payload.queued_len(),
        AppEvent::WebSocketSend(payload) => payload.len(),
        AppEvent::SseEvent(frame) => {
            frame.data.as_deref().map_or(0, str::len)
                + frame.event.as_deref().map_or(0, str::len)
                + frame.comment.as_deref().map_or(0, str::len)
        }
        _ => 0,
    }
}

/// The server-owned feeder for a scope's `receive` stream.
///
/// The channel is bounded; for WebSocket scopes the capacity is the receive
/// queue cap, so a slow application exerts backpressure on the socket reader
/// rather than buffering without bound.
#[derive(Clone)]
pub struct ServerEventQueue {
    tx: mpsc::Sender<ServerEvent>,
}

impl ServerEventQueue {
    /// Deliver an event; `false` means the application is no longer reading.
    pub async fn push(&self, event: ServerEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Non-blocking delivery. `Err` carries the event back when the queue is
    /// full or the application is gone.
    pub fn try_push(&self, event: ServerEvent) -> Result<(), ServerEvent> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
        })
    }

    /// True when the queue has no free slot.
    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }
}

/// The server-owned drain for a scope's `send` stream.
pub struct AppEventQueue {
    rx: mpsc::Receiver<AppEvent>,
}

impl AppEventQueue {
    /// The next application event, or `None` when the application dropped
    /// its sender (scope complete).
    pub async fn next(&mut self) -> Option<AppEvent> {
        self.rx.recv().await
    }

    /// A queue that yields `None` immediately; a placeholder for scopes
    /// whose application side never materialized.
    pub fn closed() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self { rx }
    }
}

struct ChannelSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<ServerEvent>>,
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next(&self) -> Option<ServerEvent> {
        self.rx.lock().await.recv().await
    }
}

struct ChannelSink {
    tx: mpsc::Sender<AppEvent>,
    budget: Option<Arc<WriteBudget>>,
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: AppEvent) -> Result<(), ProtocolError> {
        let cost = event_cost(&event);
        if let Some(budget) = &self.budget {
            budget.debit(cost).await;
        }
        match self.tx.send(event).await {
            Ok(()) => Ok(()),
            Err(_) => {
                if let Some(budget) = &self.budget {
                    budget.credit(cost);
                }
                Err(ProtocolError::Closed)
            }
        }
    }
}

/// Build the server→application event stream.
pub fn server_channel(capacity: usize) -> (ServerEventQueue, Receiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ServerEventQueue { tx },
        Receiver::from_source(Arc::new(ChannelSource {
            rx: tokio::sync::Mutex::new(rx),
        })),
    )
}

/// Build the application→server event stream, optionally debiting a write
/// budget for watermark backpressure.
pub fn app_channel(capacity: usize, budget: Option<Arc<WriteBudget>>) -> (Sender, AppEventQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Sender::from_sink(Arc::new(ChannelSink { tx, budget })),
        AppEventQueue { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BodyPayload, WsPayload};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn events_round_trip_in_order() {
        let (queue, receiver) = server_channel(8);
        assert!(
            queue
                .push(ServerEvent::HttpRequest {
                    body: Bytes::from_static(b"ab"),
                    more: true,
                })
                .await
        );
        assert!(queue.push(ServerEvent::HttpDisconnect).await);

        match receiver.next().await.unwrap() {
            ServerEvent::HttpRequest { body, more } => {
                assert_eq!(&body[..], b"ab");
                assert!(more);
            }
            other => panic!("unexpected event {}", other.name()),
        }
        assert!(matches!(
            receiver.next().await,
            Some(ServerEvent::HttpDisconnect)
        ));
    }

    #[tokio::test]
    async fn sender_reports_closed_when_server_side_drops() {
        let (sender, queue) = app_channel(1, None);
        drop(queue);
        let err = sender
            .send(AppEvent::WebSocketSend(WsPayload::Text("x".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
    }

    #[tokio::test]
    async fn write_budget_suspends_over_high_and_resumes_below_low() {
        let budget = WriteBudget::new(10, 4);
        budget.debit(8).await;
        budget.debit(8).await; // 16 queued: trips the high watermark
        assert_eq!(budget.queued(), 16);

        let blocked = {
            let budget = budget.clone();
            tokio::spawn(async move {
                budget.debit(1).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        budget.credit(6); // 10 queued, still >= low? 10 >= 4: stays suspended
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        budget.credit(13); // 0 queued: resumes
        blocked.await.unwrap();
        assert_eq!(budget.queued(), 1);
    }

    #[tokio::test]
    async fn inspect_observes_without_consuming() {
        let seen = Arc::new(AtomicUsize::new(0));
        let (sender, mut queue) = app_channel(4, None);
        let sender = sender.inspect({
            let seen = seen.clone();
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        sender
            .send(AppEvent::ResponseBody {
                payload: BodyPayload::from("hi"),
                more: false,
            })
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(queue.next().await.is_some());
    }
}
