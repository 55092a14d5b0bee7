//! Response-body plumbing between application events and the wire.
//!
//! The application's `ResponseBody`/`ResponseTrailers` events are translated
//! by a driver task into frames on a bounded channel; [`EventBody`] yields
//! those frames to the framing layer, crediting the write budget as bytes
//! leave the queue and counting what was actually handed to the transport
//! for the access log.

use std::convert::Infallible;
use std::io::{Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Local};
use http::HeaderMap;
use http_body::Frame;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use pagi_protocol::{
    AppEvent, AppEventQueue, BodyPayload, ServerEvent, ServerEventQueue, WriteBudget,
};

use crate::accesslog::{AccessLog, LogRecord};
use crate::meter::{CloseSignal, ConnMode, ConnStats};

const FILE_CHUNK: usize = 64 * 1024;

pub(crate) enum BodyFrame {
    Data(Bytes),
    Trailers(HeaderMap),
}

/// Everything needed to emit one access-log line when the response body is
/// done (or abandoned), plus the mode reset back to keep-alive idle.
pub(crate) struct ResponseFinisher {
    pub access_log: Option<Arc<AccessLog>>,
    pub remote: SocketAddr,
    pub method: String,
    pub target: String,
    pub version: String,
    pub status: u16,
    pub started_at: DateTime<Local>,
    pub start: Instant,
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub stats: Arc<ConnStats>,
    /// HTTP responses return the connection to `Idle`; WebSocket/SSE modes
    /// are terminal and skip the reset.
    pub reset_mode: bool,
}

impl ResponseFinisher {
    fn finish(self, bytes: u64) {
        if self.reset_mode {
            self.stats.set_mode(ConnMode::Idle);
        }
        if let Some(log) = &self.access_log {
            log.log(&LogRecord {
                remote: self.remote,
                user: None,
                time: self.started_at,
                method: &self.method,
                target: &self.target,
                version: &self.version,
                status: self.status,
                bytes,
                duration: self.start.elapsed(),
                request_headers: &self.request_headers,
                response_headers: &self.response_headers,
            });
        }
    }
}

enum BodyKind {
    Empty,
    Once(Option<Bytes>),
    Streamed {
        rx: mpsc::Receiver<BodyFrame>,
        budget: Arc<WriteBudget>,
    },
}

/// The response body handed to the framing layer.
pub(crate) struct EventBody {
    kind: BodyKind,
    written: u64,
    finisher: Option<ResponseFinisher>,
}

impl EventBody {
    pub fn empty(finisher: Option<ResponseFinisher>) -> Self {
        Self {
            kind: BodyKind::Empty,
            written: 0,
            finisher,
        }
    }

    pub fn once(bytes: Bytes, finisher: Option<ResponseFinisher>) -> Self {
        Self {
            kind: BodyKind::Once(Some(bytes)),
            written: 0,
            finisher,
        }
    }

    pub fn streamed(
        rx: mpsc::Receiver<BodyFrame>,
        budget: Arc<WriteBudget>,
        finisher: Option<ResponseFinisher>,
    ) -> Self {
        Self {
            kind: BodyKind::Streamed { rx, budget },
            written: 0,
            finisher,
        }
    }
}

impl http_body::Body for EventBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match &mut this.kind {
            BodyKind::Empty => Poll::Ready(None),
            BodyKind::Once(bytes) => Poll::Ready(bytes.take().map(|b| {
                this.written += b.len() as u64;
                Ok(Frame::data(b))
            })),
            BodyKind::Streamed { rx, budget } => match rx.poll_recv(cx) {
                Poll::Ready(Some(BodyFrame::Data(b))) => {
                    budget.credit(b.len());
                    this.written += b.len() as u64;
                    Poll::Ready(Some(Ok(Frame::data(b))))
                }
                Poll::Ready(Some(BodyFrame::Trailers(headers))) => {
                    Poll::Ready(Some(Ok(Frame::trailers(headers))))
                }
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            BodyKind::Empty => true,
            BodyKind::Once(bytes) => bytes.is_none(),
            BodyKind::Streamed { .. } => false,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match &self.kind {
            BodyKind::Empty => http_body::SizeHint::with_exact(0),
            BodyKind::Once(Some(b)) => http_body::SizeHint::with_exact(b.len() as u64),
            BodyKind::Once(None) => http_body::SizeHint::with_exact(0),
            BodyKind::Streamed { .. } => http_body::SizeHint::default(),
        }
    }
}

impl Drop for EventBody {
    fn drop(&mut self) {
        if let Some(finisher) = self.finisher.take() {
            finisher.finish(self.written);
        }
    }
}

/// Translates application body events into wire frames.
pub(crate) struct BodyDriver {
    pub events: AppEventQueue,
    pub frames: mpsc::Sender<BodyFrame>,
    pub queue: ServerEventQueue,
    /// HEAD responses: consume events, write nothing.
    pub head: bool,
    /// `trailers: true` was declared in the response start.
    pub trailers_declared: bool,
    /// The negotiated encoding can carry a trailer block.
    pub trailers_supported: bool,
    pub budget: Arc<WriteBudget>,
    pub sync_file_threshold: u64,
    pub close: Arc<CloseSignal>,
}

impl BodyDriver {
    /// Run until the application's body is complete or the client is gone.
    /// Client departure is observed both as a failed frame send and as the
    /// frame channel closing, so a handler parked between installments
    /// still receives its disconnect event.
    pub async fn run(self) {
        let BodyDriver {
            mut events,
            frames,
            queue,
            head,
            trailers_declared,
            trailers_supported,
            budget,
            sync_file_threshold,
            close,
        } = self;
        let emitter = Emitter {
            frames: frames.clone(),
            head,
            budget,
            sync_file_threshold,
            close,
        };

        let mut body_finished = false;
        let mut trailer_acc: Option<HeaderMap> = None;
        // For HEAD the peer never takes the body, so its channel closing is
        // expected and not a disconnect.
        let mut frames_gone = false;

        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = frames.closed(), if !frames_gone => {
                    frames_gone = true;
                    if head {
                        continue;
                    }
                    queue.push(ServerEvent::HttpDisconnect).await;
                    return;
                }
            };
            match event {
                Some(AppEvent::ResponseBody { payload, more }) => {
                    if body_finished {
                        tracing::debug!("body event after the final installment; dropped");
                        continue;
                    }
                    if !emitter.emit(payload).await {
                        // Receiver gone: the client disconnected or the
                        // response was abandoned mid-write.
                        queue.push(ServerEvent::HttpDisconnect).await;
                        return;
                    }
                    if !more {
                        body_finished = true;
                        if !(trailers_declared && trailers_supported) {
                            return;
                        }
                    }
                }
                Some(AppEvent::ResponseTrailers { headers, more }) => {
                    if trailers_declared && trailers_supported {
                        trailer_acc
                            .get_or_insert_with(HeaderMap::new)
                            .extend(headers);
                        if !more {
                            if let Some(trailers) = trailer_acc.take() {
                                let _ = frames.send(BodyFrame::Trailers(trailers)).await;
                            }
                            return;
                        }
                    } else {
                        tracing::warn!(
                            declared = trailers_declared,
                            "response trailers discarded: not declared or encoding cannot carry them"
                        );
                        if !more && body_finished {
                            return;
                        }
                    }
                }
                Some(other) => {
                    tracing::debug!(event = other.name(), "unexpected event during response body");
                }
                None => return,
            }
        }
    }
}

struct Emitter {
    frames: mpsc::Sender<BodyFrame>,
    head: bool,
    budget: Arc<WriteBudget>,
    sync_file_threshold: u64,
    close: Arc<CloseSignal>,
}

impl Emitter {
    /// Returns false when the frame receiver is gone.
    async fn emit(&self, payload: BodyPayload) -> bool {
        match payload {
            BodyPayload::Bytes(bytes) => {
                if self.head {
                    self.budget.credit(bytes.len());
                    return true;
                }
                self.frames.send(BodyFrame::Data(bytes)).await.is_ok()
            }
            BodyPayload::File {
                path,
                offset,
                length,
            } => match self.stream_file(&path, offset, length).await {
                Ok(delivered) => delivered,
                Err(err) => {
                    // Mid-body there is no way to switch to an error
                    // response; end the body and drop the connection so the
                    // client sees a truncated transfer, not a silent one.
                    tracing::error!(path = %path.display(), error = %err, "file streaming failed");
                    self.close.request();
                    false
                }
            },
            BodyPayload::Handle { file, length } => match self.stream_handle(file, length).await {
                Ok(delivered) => delivered,
                Err(err) => {
                    tracing::error!(error = %err, "handle streaming failed");
                    self.close.request();
                    false
                }
            },
        }
    }

    async fn stream_file(
        &self,
        path: &std::path::Path,
        offset: u64,
        length: Option<u64>,
    ) -> std::io::Result<bool> {
        let metadata = tokio::fs::metadata(path).await?;
        let available = metadata.len().saturating_sub(offset);
        let to_send = length.map_or(available, |l| l.min(available));

        if self.head {
            return Ok(true);
        }

        if to_send <= self.sync_file_threshold {
            // Small enough to read on the event-loop thread in one go.
            let path = path.to_path_buf();
            let mut file = std::fs::File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; to_send as usize];
            file.read_exact(&mut buf)?;
            return Ok(self.frames.send(BodyFrame::Data(buf.into())).await.is_ok());
        }

        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        self.copy_chunks(&mut file, Some(to_send)).await
    }

    async fn stream_handle(
        &self,
        mut file: tokio::fs::File,
        length: Option<u64>,
    ) -> std::io::Result<bool> {
        if self.head {
            return Ok(true);
        }
        let sent = self.copy_chunks(&mut file, length).await?;
        Ok(sent)
    }

    /// Copy up to `limit` bytes (or to EOF) in bounded chunks. A handle that
    /// runs dry before its declared length poisons keep-alive framing, so
    /// the connection is marked for close.
    async fn copy_chunks(
        &self,
        file: &mut tokio::fs::File,
        limit: Option<u64>,
    ) -> std::io::Result<bool> {
        let mut remaining = limit;
        loop {
            let want = match remaining {
                Some(0) => return Ok(true),
                Some(n) => (n as usize).min(FILE_CHUNK),
                None => FILE_CHUNK,
            };
            let mut buf = vec![0u8; want];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                if let Some(short) = remaining {
                    if short > 0 {
                        tracing::warn!(
                            missing = short,
                            "file handle ended before its declared length; closing connection after response"
                        );
                        self.close.request();
                    }
                }
                return Ok(true);
            }
            buf.truncate(n);
            if self.frames.send(BodyFrame::Data(buf.into())).await.is_err() {
                return Ok(false);
            }
            if let Some(r) = &mut remaining {
                *r -= n as u64;
            }
        }
    }
}

/// Feeds the inbound request body to the application as `HttpRequest`
/// events, enforcing the cumulative body-size cap.
pub(crate) async fn feed_request_body(
    body: hyper::body::Incoming,
    queue: ServerEventQueue,
    max_body_size: u64,
    overflow: tokio::sync::watch::Sender<bool>,
) {
    use http_body_util::BodyExt;

    let mut body = body;
    let mut total: u64 = 0;
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    // Inbound trailers are not part of the event vocabulary.
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                total += data.len() as u64;
                if max_body_size > 0 && total > max_body_size {
                    tracing::debug!(total, max_body_size, "request body over limit");
                    let _ = overflow.send(true);
                    return;
                }
                if !queue
                    .push(ServerEvent::HttpRequest {
                        body: data,
                        more: true,
                    })
                    .await
                {
                    return;
                }
            }
            Some(Err(err)) => {
                tracing::debug!(error = %err, "request body error; delivering disconnect");
                queue.push(ServerEvent::HttpDisconnect).await;
                return;
            }
            None => {
                queue
                    .push(ServerEvent::HttpRequest {
                        body: Bytes::new(),
                        more: false,
                    })
                    .await;
                return;
            }
        }
    }
}
