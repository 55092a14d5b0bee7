//! The Server-Sent Events subprotocol.
//!
//! A GET whose `Accept` includes `text/event-stream` becomes an SSE scope.
//! The application opens the stream with `sse.response.start` and emits
//! records; the server frames them per the event-stream format and delivers
//! `sse.disconnect` when the client goes away. Comment keepalives are
//! ordinary frames from the application's side and never split a record.

use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use tokio::sync::mpsc;

use pagi_protocol::{
    app_channel, server_channel, validating_sender, AppError, AppEvent, AppEventQueue,
    Scope, ScopeKind, ServerEvent, ServerEventQueue, SseFrame, Tasks, WriteBudget,
};

use crate::body::{BodyFrame, EventBody};
use crate::connection::ConnContext;
use crate::http::{canned, finisher_for, request_scope};
use crate::meter::ConnMode;

pub(crate) async fn handle(ctx: Arc<ConnContext>, req: Request<Incoming>) -> Response<EventBody> {
    let config = &ctx.core.config;
    let (parts, _body) = req.into_parts();

    let scope = Scope::Sse(request_scope(&ctx, &parts, Tasks::disconnected()));

    let budget = WriteBudget::new(config.write_high_watermark, config.write_low_watermark);
    let (queue, receiver) = server_channel(4);
    let (sender, mut events) = app_channel(16, Some(budget.clone()));
    let sender = if config.validate_events() {
        validating_sender(ScopeKind::Sse, sender)
    } else {
        sender
    };

    let app = ctx.core.app.clone();
    let app_task = tokio::spawn(async move { app.call(scope, receiver, sender).await });

    match events.next().await {
        Some(AppEvent::SseStart { headers }) => {
            ctx.stats.set_mode(ConnMode::Sse);

            let mut response_headers = HeaderMap::new();
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            response_headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache"),
            );
            for (name, value) in headers.iter() {
                response_headers.append(name, value.clone());
            }

            let finisher = finisher_for(&ctx, &parts, StatusCode::OK, false, response_headers.clone());

            let (frames, frame_rx) = mpsc::channel(8);
            let pump = tokio::spawn(drive(events, frames, queue, budget.clone()));
            *ctx.pump.lock().await = Some(pump);
            drop(app_task);

            let mut response =
                Response::new(EventBody::streamed(frame_rx, budget, Some(finisher)));
            *response.status_mut() = StatusCode::OK;
            *response.headers_mut() = response_headers;
            response
        }
        Some(other) => {
            tracing::debug!(event = other.name(), "unexpected event before sse start");
            app_task.abort();
            canned(
                &ctx,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                false,
                Some(&parts),
            )
        }
        None => match app_task.await {
            Ok(Err(AppError::Unsupported)) => {
                canned(&ctx, StatusCode::NOT_FOUND, "Not Found", false, Some(&parts))
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "application error before sse start");
                canned(
                    &ctx,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    false,
                    Some(&parts),
                )
            }
            Ok(Ok(())) | Err(_) => {
                tracing::debug!("application ended the sse scope without starting the stream");
                canned(
                    &ctx,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    false,
                    Some(&parts),
                )
            }
        },
    }
}

/// Render one record in event-stream framing. Field order: comment, id,
/// event, retry, then data lines, then the blank separator.
fn encode_frame(frame: &SseFrame) -> Bytes {
    let mut out = String::new();
    if let Some(comment) = &frame.comment {
        for line in comment.split('\n') {
            out.push_str(": ");
            out.push_str(line);
            out.push('\n');
        }
    }
    if let Some(id) = &frame.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(event) = &frame.event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    if let Some(retry) = frame.retry {
        out.push_str("retry: ");
        out.push_str(&retry.to_string());
        out.push('\n');
    }
    if let Some(data) = &frame.data {
        for line in data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push('\n');
    Bytes::from(out)
}

async fn drive(
    mut events: AppEventQueue,
    frames: mpsc::Sender<BodyFrame>,
    queue: ServerEventQueue,
    budget: Arc<WriteBudget>,
) {
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            // The response body was dropped: the client is gone. Tell the
            // application even if it is quiet between events.
            _ = frames.closed() => {
                queue.push(ServerEvent::SseDisconnect).await;
                return;
            }
        };
        match event {
            Some(AppEvent::SseEvent(frame)) => {
                let empty = frame.data.is_none()
                    && frame.event.is_none()
                    && frame.id.is_none()
                    && frame.retry.is_none()
                    && frame.comment.is_none();
                if empty {
                    // A bare terminator frame; nothing to put on the wire.
                    if !frame.more {
                        return;
                    }
                    continue;
                }
                let cost = frame.data.as_deref().map_or(0, str::len)
                    + frame.event.as_deref().map_or(0, str::len)
                    + frame.comment.as_deref().map_or(0, str::len);
                let encoded = encode_frame(&frame);
                let framed = encoded.len();
                if frames.send(BodyFrame::Data(encoded)).await.is_err() {
                    budget.credit(cost);
                    queue.push(ServerEvent::SseDisconnect).await;
                    return;
                }
                // The application was debited for the raw field bytes; the
                // framed form is what gets credited on write, so account for
                // the framing overhead here.
                if framed > cost {
                    budget.debit(framed - cost).await;
                }
                if !frame.more {
                    return;
                }
            }
            Some(other) => {
                tracing::debug!(event = other.name(), "unexpected event on sse scope");
            }
            None => {
                // Application finished; end the stream.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_frame_renders_all_fields_in_order() {
        let frame = SseFrame {
            data: Some("line1\nline2".into()),
            event: Some("update".into()),
            id: Some("42".into()),
            retry: Some(3000),
            comment: None,
            more: true,
        };
        let encoded = encode_frame(&frame);
        assert_eq!(
            &encoded[..],
            b"id: 42\nevent: update\nretry: 3000\ndata: line1\ndata: line2\n\n" as &[u8]
        );
    }

    #[test]
    fn comment_frame_renders_as_comment_lines() {
        let encoded = encode_frame(&SseFrame::comment("keepalive"));
        assert_eq!(&encoded[..], b": keepalive\n\n" as &[u8]);
    }

    #[test]
    fn data_frame_ends_with_blank_separator() {
        let encoded = encode_frame(&SseFrame::data("tick"));
        assert_eq!(&encoded[..], b"data: tick\n\n" as &[u8]);
    }
}
