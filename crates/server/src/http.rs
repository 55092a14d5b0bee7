//! Per-request bridging between the framing layer and PAGI events.
//!
//! Each hyper request is classified into a scope kind, handed to the
//! application over fresh event channels, and the application's events are
//! assembled back into a hyper response with a streaming body.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::request::Parts;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version};
use hyper::body::Incoming;
use percent_encoding::percent_decode_str;
use tokio::sync::{mpsc, watch};

use pagi_protocol::{
    app_channel, server_channel, validating_sender, AppError, AppEvent, PathParams, RequestScope,
    Scope, ScopeKind, Stash, Tasks, WriteBudget,
};

use crate::body::{feed_request_body, BodyDriver, EventBody, ResponseFinisher};
use crate::connection::ConnContext;
use crate::meter::ConnMode;
use crate::{sse, ws};

/// Which subprotocol a request selects, decided from transport-level
/// signals before the application is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Http,
    WebSocket,
    Sse,
}

pub(crate) fn classify(req: &Request<Incoming>) -> RequestKind {
    if is_websocket_upgrade(req) {
        return RequestKind::WebSocket;
    }
    let wants_event_stream = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.to_ascii_lowercase().contains("text/event-stream"));
    if wants_event_stream && req.method() == Method::GET {
        return RequestKind::Sse;
    }
    RequestKind::Http
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    if req.version() == Version::HTTP_2 {
        // RFC 8441 Extended CONNECT with `:protocol = websocket`.
        return req.method() == Method::CONNECT
            && req
                .extensions()
                .get::<hyper::ext::Protocol>()
                .is_some_and(|p| p.as_str().eq_ignore_ascii_case("websocket"));
    }
    let has_upgrade_token = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
    let upgrades_to_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    has_upgrade_token && upgrades_to_websocket
}

/// Entry point for every request on a connection.
pub(crate) async fn handle(ctx: Arc<ConnContext>, req: Request<Incoming>) -> Response<EventBody> {
    ctx.stats.set_mode(ConnMode::Handling);
    account_request(&ctx);

    if let Some(response) = reject_oversized_head(&ctx, req.headers()) {
        return response;
    }

    match classify(&req) {
        RequestKind::WebSocket => ws::handle(ctx, req).await,
        RequestKind::Sse => sse::handle(ctx, req).await,
        RequestKind::Http => handle_http(ctx, req).await,
    }
}

fn account_request(ctx: &ConnContext) {
    let core = &ctx.core;
    let served = core.requests_served.fetch_add(1, Ordering::SeqCst) + 1;
    let budget = core.config.max_requests;
    if budget > 0 && served == budget {
        tracing::info!(served, "request budget reached; recycling after in-flight work");
        core.begin_shutdown();
    }
}

/// `max_header_size` / `max_header_count` violations produce a 400 and the
/// connection is closed.
fn reject_oversized_head(ctx: &Arc<ConnContext>, headers: &HeaderMap) -> Option<Response<EventBody>> {
    let config = &ctx.core.config;
    if config.max_header_count > 0 && headers.len() > config.max_header_count {
        tracing::debug!(count = headers.len(), "header count over limit");
        return Some(canned(ctx, StatusCode::BAD_REQUEST, "Bad Request", true, None));
    }
    if config.max_header_size > 0 {
        let total: usize = headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len() + 4)
            .sum();
        if total > config.max_header_size {
            tracing::debug!(total, "header block over limit");
            return Some(canned(ctx, StatusCode::BAD_REQUEST, "Bad Request", true, None));
        }
    }
    None
}

/// Build the request scope shared by the HTTP, WebSocket and SSE paths.
pub(crate) fn request_scope(ctx: &ConnContext, parts: &Parts, tasks: Tasks) -> RequestScope {
    let raw_path = parts.uri.path();
    let path = percent_decode_str(raw_path).decode_utf8_lossy().into_owned();
    let query = parts.uri.query().unwrap_or("");
    RequestScope {
        method: parts.method.clone(),
        path,
        raw_path: Bytes::copy_from_slice(raw_path.as_bytes()),
        query_string: Bytes::copy_from_slice(query.as_bytes()),
        headers: parts.headers.clone(),
        scheme: ctx.scheme,
        http_version: parts.version,
        client: ctx.client,
        server: ctx.local,
        tls: ctx.tls.clone(),
        root_path: String::new(),
        pagi: ctx.core.pagi.clone(),
        state: ctx.core.state.clone(),
        stash: Stash::new(),
        tasks,
        path_params: PathParams::new(),
        route: None,
    }
}

/// A finisher for the access log, captured before the scope is moved into
/// the application.
pub(crate) fn finisher_for(
    ctx: &ConnContext,
    parts: &Parts,
    status: StatusCode,
    reset_mode: bool,
    response_headers: HeaderMap,
) -> ResponseFinisher {
    ResponseFinisher {
        access_log: ctx.core.access_log.clone(),
        remote: ctx.client,
        method: parts.method.to_string(),
        target: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        version: format!("{:?}", parts.version),
        status: status.as_u16(),
        started_at: chrono::Local::now(),
        start: Instant::now(),
        request_headers: parts.headers.clone(),
        response_headers,
        stats: ctx.stats.clone(),
        reset_mode,
    }
}

/// A minimal complete response produced by the server itself.
pub(crate) fn canned(
    ctx: &Arc<ConnContext>,
    status: StatusCode,
    body: &'static str,
    close: bool,
    parts: Option<&Parts>,
) -> Response<EventBody> {
    if close {
        ctx.close.request();
    }
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    if status == StatusCode::SERVICE_UNAVAILABLE {
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    }
    let finisher =
        parts.map(|parts| finisher_for(ctx, parts, status, true, headers.clone()));

    let mut response = Response::new(EventBody::once(Bytes::from_static(body.as_bytes()), finisher));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn ensure_identity_headers(headers: &mut HeaderMap) {
    if !headers.contains_key(header::SERVER) {
        headers.insert(
            header::SERVER,
            HeaderValue::from_static(concat!("pagi/", env!("CARGO_PKG_VERSION"))),
        );
    }
    if !headers.contains_key(header::DATE) {
        let now = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        if let Ok(value) = HeaderValue::from_str(&now.to_string()) {
            headers.insert(header::DATE, value);
        }
    }
}

async fn handle_http(ctx: Arc<ConnContext>, req: Request<Incoming>) -> Response<EventBody> {
    let config = &ctx.core.config;
    let (parts, body) = req.into_parts();

    // Declared-length fast path for the body cap.
    if config.max_body_size > 0 {
        if let Some(declared) = content_length(&parts.headers) {
            if declared > config.max_body_size {
                tracing::debug!(declared, "declared request body over limit");
                return canned(
                    &ctx,
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Payload Too Large",
                    true,
                    Some(&parts),
                );
            }
        }
    }

    let (tasks, mut task_queue) = Tasks::channel();
    let scope = Scope::Http(request_scope(&ctx, &parts, tasks));

    let budget = WriteBudget::new(config.write_high_watermark, config.write_low_watermark);
    let (queue, receiver) = server_channel(8);
    let (sender, mut events) = app_channel(16, Some(budget.clone()));
    let sender = if config.validate_events() {
        validating_sender(ScopeKind::Http, sender)
    } else {
        sender
    };

    let app = ctx.core.app.clone();
    let app_task = tokio::spawn(async move { app.call(scope, receiver, sender).await });

    let (overflow_tx, mut overflow_rx) = watch::channel(false);
    let feeder = tokio::spawn(feed_request_body(
        body,
        queue.clone(),
        config.max_body_size,
        overflow_tx,
    ));

    let overflowed = async move {
        let overflowed = {
            let res = overflow_rx.wait_for(|v| *v).await;
            res.is_ok()
        };
        if !overflowed {
            // Feeder finished without overflow; never resolve.
            std::future::pending::<()>().await;
        }
    };

    enum First {
        Event(Option<AppEvent>),
        Overflow,
    }

    // The select only decides what arrived first; the futures are dropped
    // before the channels are moved into the body driver.
    let first = tokio::select! {
        ev = events.next() => First::Event(ev),
        _ = overflowed => First::Overflow,
    };

    match first {
        First::Event(first) => match first {
            Some(AppEvent::ResponseStart { status, headers, trailers }) => {
                let mut headers = headers;
                ensure_identity_headers(&mut headers);

                let head = parts.method == Method::HEAD;
                let is_h2 = parts.version == Version::HTTP_2;
                let trailers_supported =
                    is_h2 || !headers.contains_key(header::CONTENT_LENGTH);

                let finisher = finisher_for(&ctx, &parts, status, true, headers.clone());
                let (frames, frame_rx) = mpsc::channel(8);
                let driver = BodyDriver {
                    events,
                    frames,
                    queue: queue.clone(),
                    head,
                    trailers_declared: trailers,
                    trailers_supported,
                    budget: budget.clone(),
                    sync_file_threshold: config.sync_file_threshold,
                    close: ctx.close.clone(),
                };

                let scope_ctx = ctx.clone();
                tokio::spawn(async move {
                    driver.run().await;
                    feeder.abort();
                    // Background tasks run only after the handler returns.
                    match app_task.await {
                        Ok(Ok(())) | Err(_) => {}
                        Ok(Err(err)) => {
                            // Past the response start there is no way to
                            // send a well-formed error; the response is
                            // abandoned and the connection goes with it.
                            tracing::debug!(error = %err, "application errored after response start");
                            scope_ctx.close.request();
                        }
                    }
                    for task in task_queue.drain() {
                        scope_ctx.core.background.adopt(task);
                    }
                });

                let mut response = Response::new(EventBody::streamed(
                    frame_rx,
                    budget,
                    Some(finisher),
                ));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Some(other) => {
                tracing::debug!(
                    event = other.name(),
                    "application emitted an event before the response start"
                );
                app_task.abort();
                feeder.abort();
                canned(&ctx, StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", false, Some(&parts))
            }
            None => {
                feeder.abort();
                match app_task.await {
                    Ok(Err(AppError::Unsupported)) => {
                        canned(&ctx, StatusCode::NOT_FOUND, "Not Found", false, Some(&parts))
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "application error before response start");
                        canned(&ctx, StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", false, Some(&parts))
                    }
                    Ok(Ok(())) => {
                        tracing::error!("application completed without producing a response");
                        canned(&ctx, StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", false, Some(&parts))
                    }
                    Err(join_err) => {
                        tracing::error!(error = %join_err, "application task failed");
                        canned(&ctx, StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", false, Some(&parts))
                    }
                }
            }
        },
        First::Overflow => {
            tracing::debug!("request body exceeded max_body_size before response start");
            app_task.abort();
            feeder.abort();
            canned(&ctx, StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large", true, Some(&parts))
        }
    }
}
