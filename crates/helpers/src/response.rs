use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};

use pagi_protocol::{AppEvent, BodyPayload, ProtocolError, Sender};

/// Fluent response builder over a scope's `send` stream.
///
/// Status and headers accumulate until a finisher consumes the builder and
/// emits exactly one `http.response.start` followed by the body. Finishers
/// take `self` by value, so a second send is a compile error rather than a
/// protocol violation.
pub struct Response {
    send: Sender,
    status: StatusCode,
    headers: HeaderMap,
}

impl Response {
    pub fn new(send: Sender) -> Self {
        Self {
            send,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Append a header. Invalid names or values are dropped with a log line
    /// rather than failing the response.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            name.parse::<http::header::HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::debug!(name, "dropping invalid response header"),
        }
        self
    }

    pub fn content_type(mut self, value: &'static str) -> Self {
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
        self
    }

    async fn start(&mut self, content_length: Option<u64>) -> Result<(), ProtocolError> {
        if let Some(len) = content_length {
            self.headers
                .entry(header::CONTENT_LENGTH)
                .or_insert_with(|| HeaderValue::from(len));
        }
        self.send
            .send(AppEvent::ResponseStart {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
                trailers: false,
            })
            .await
    }

    async fn finish_with(mut self, body: Bytes) -> Result<(), ProtocolError> {
        self.start(Some(body.len() as u64)).await?;
        self.send
            .send(AppEvent::ResponseBody {
                payload: BodyPayload::Bytes(body),
                more: false,
            })
            .await
    }

    fn default_content_type(mut self, value: &'static str) -> Self {
        if !self.headers.contains_key(header::CONTENT_TYPE) {
            self.headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
        }
        self
    }

    /// Finish with a UTF-8 text body.
    pub async fn text(self, body: impl Into<String>) -> Result<(), ProtocolError> {
        self.default_content_type("text/plain; charset=utf-8")
            .finish_with(Bytes::from(body.into()))
            .await
    }

    /// Finish with an HTML body.
    pub async fn html(self, body: impl Into<String>) -> Result<(), ProtocolError> {
        self.default_content_type("text/html; charset=utf-8")
            .finish_with(Bytes::from(body.into()))
            .await
    }

    /// Finish with a JSON body serialized from `value`.
    pub async fn json<T: serde::Serialize>(self, value: &T) -> Result<(), ProtocolError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| ProtocolError::InvalidEventSequence(format!("json body: {e}")))?;
        self.default_content_type("application/json; charset=utf-8")
            .finish_with(Bytes::from(body))
            .await
    }

    /// Finish with a `302 Found` (or the already-set 3xx status) redirect.
    pub async fn redirect(mut self, location: &str) -> Result<(), ProtocolError> {
        if !self.status.is_redirection() {
            self.status = StatusCode::FOUND;
        }
        if let Ok(value) = HeaderValue::from_str(location) {
            self.headers.insert(header::LOCATION, value);
        }
        self.finish_with(Bytes::new()).await
    }

    /// Finish with no body (`204 No Content` unless a status was set).
    pub async fn empty(mut self) -> Result<(), ProtocolError> {
        if self.status == StatusCode::OK {
            self.status = StatusCode::NO_CONTENT;
        }
        self.start(None).await?;
        self.send
            .send(AppEvent::ResponseBody {
                payload: BodyPayload::Bytes(Bytes::new()),
                more: false,
            })
            .await
    }

    /// Finish with an error status and a plain-text message.
    pub async fn error(self, status: StatusCode, message: &str) -> Result<(), ProtocolError> {
        self.status(status)
            .default_content_type("text/plain; charset=utf-8")
            .finish_with(Bytes::from(message.to_string()))
            .await
    }

    /// Finish with raw bytes.
    pub async fn send(self, body: impl Into<Bytes>) -> Result<(), ProtocolError> {
        self.default_content_type("application/octet-stream")
            .finish_with(body.into())
            .await
    }

    /// Finish by streaming a file from disk. The length (and thus
    /// `Content-Length`) comes from file metadata; offset/length windows
    /// are the caller's business via [`send_file_range`](Self::send_file_range).
    pub async fn send_file(self, path: impl Into<std::path::PathBuf>) -> anyhow::Result<()> {
        self.send_file_range(path, 0, None).await
    }

    pub async fn send_file_range(
        mut self,
        path: impl Into<std::path::PathBuf>,
        offset: u64,
        length: Option<u64>,
    ) -> anyhow::Result<()> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let available = metadata.len().saturating_sub(offset);
        let len = length.map_or(available, |l| l.min(available));

        self = self.default_content_type("application/octet-stream");
        self.start(Some(len)).await?;
        self.send
            .send(AppEvent::ResponseBody {
                payload: BodyPayload::File {
                    path,
                    offset,
                    length: Some(len),
                },
                more: false,
            })
            .await?;
        Ok(())
    }

    /// Finish by handing a [`Writer`] to `stream`; each write becomes one
    /// body installment, and the final empty installment is emitted when
    /// the callback returns.
    pub async fn stream<F, Fut>(mut self, stream: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(Writer) -> Fut,
        Fut: std::future::Future<Output = Result<(), ProtocolError>>,
    {
        self.start(None).await?;
        let writer = Writer {
            send: self.send.clone(),
        };
        stream(writer).await?;
        self.send
            .send(AppEvent::ResponseBody {
                payload: BodyPayload::Bytes(Bytes::new()),
                more: false,
            })
            .await
    }
}

/// Emits body chunks for [`Response::stream`].
pub struct Writer {
    send: Sender,
}

impl Writer {
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), ProtocolError> {
        self.send
            .send(AppEvent::ResponseBody {
                payload: BodyPayload::Bytes(chunk.into()),
                more: true,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagi_protocol::app_channel;

    async fn collect(events: &mut pagi_protocol::AppEventQueue) -> (StatusCode, HeaderMap, Vec<u8>) {
        let (status, headers) = match events.next().await {
            Some(AppEvent::ResponseStart {
                status, headers, ..
            }) => (status, headers),
            other => panic!("expected start, got {other:?}"),
        };
        let mut body = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                AppEvent::ResponseBody {
                    payload: BodyPayload::Bytes(b),
                    more,
                } => {
                    body.extend_from_slice(&b);
                    if !more {
                        break;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        (status, headers, body)
    }

    #[tokio::test]
    async fn text_sets_type_and_length() {
        let (sender, mut events) = app_channel(8, None);
        Response::new(sender).text("Hello").await.unwrap();
        let (status, headers, body) = collect(&mut events).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(body, b"Hello");
    }

    #[tokio::test]
    async fn json_serializes_and_keeps_custom_status() {
        let (sender, mut events) = app_channel(8, None);
        Response::new(sender)
            .status(StatusCode::CREATED)
            .json(&serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let (status, headers, body) = collect(&mut events).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
        assert_eq!(body, br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn redirect_defaults_to_found() {
        let (sender, mut events) = app_channel(8, None);
        Response::new(sender).redirect("/next").await.unwrap();
        let (status, headers, _body) = collect(&mut events).await;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(headers.get(header::LOCATION).unwrap(), "/next");
    }

    #[tokio::test]
    async fn stream_emits_chunks_then_final() {
        let (sender, mut events) = app_channel(8, None);
        Response::new(sender)
            .stream(|writer| async move {
                writer.write(&b"one"[..]).await?;
                writer.write(&b"two"[..]).await?;
                Ok(())
            })
            .await
            .unwrap();
        let (_status, _headers, body) = collect(&mut events).await;
        assert_eq!(body, b"onetwo");
    }

    #[tokio::test]
    async fn empty_defaults_to_no_content() {
        let (sender, mut events) = app_channel(8, None);
        Response::new(sender).empty().await.unwrap();
        let (status, _headers, body) = collect(&mut events).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }
}
