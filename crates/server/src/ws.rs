//! The WebSocket subprotocol.
//!
//! The handshake is driven by the application: after `websocket.connect` it
//! must either accept (optionally picking one of the client's proposed
//! subprotocols) or close, which rejects the handshake. After acceptance the
//! connection runs a framing loop until either side goes away. Ping/pong is
//! handled by the framing layer and never surfaces as events.

use std::sync::Arc;

use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Version};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as TungCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use futures::{SinkExt, StreamExt};

use pagi_protocol::{
    app_channel, server_channel, validating_sender, AppError, AppEvent, AppEventQueue, CloseCode,
    Scope, ScopeKind, ServerEvent, ServerEventQueue, Tasks, WebSocketScope, WsPayload,
    WriteBudget,
};

use crate::body::EventBody;
use crate::connection::ConnContext;
use crate::http::{canned, finisher_for, request_scope};
use crate::meter::ConnMode;
use crate::server::Phase;

pub(crate) async fn handle(ctx: Arc<ConnContext>, mut req: Request<Incoming>) -> Response<EventBody> {
    let is_h2 = req.version() == Version::HTTP_2;

    // The HTTP/1.1 handshake requires the standard key/version pair.
    let accept_key = if is_h2 {
        None
    } else {
        let version_ok = req
            .headers()
            .get(header::SEC_WEBSOCKET_VERSION)
            .is_some_and(|v| v.as_bytes() == b"13");
        let key = req
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .map(|v| derive_accept_key(v.as_bytes()));
        match (version_ok, key) {
            (true, Some(key)) => Some(key),
            _ => {
                tracing::debug!("malformed websocket upgrade request");
                return canned(&ctx, StatusCode::BAD_REQUEST, "Bad Request", true, None);
            }
        }
    };

    let upgrade = hyper::upgrade::on(&mut req);
    let (parts, _body) = req.into_parts();

    let subprotocols: Vec<String> = parts
        .headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let config = &ctx.core.config;
    let scope = Scope::WebSocket(WebSocketScope {
        request: request_scope(&ctx, &parts, Tasks::disconnected()),
        subprotocols: subprotocols.clone(),
    });

    let budget = WriteBudget::new(config.write_high_watermark, config.write_low_watermark);
    // The receive-queue cap is the channel capacity: overflow is detected
    // when a frame arrives and no slot is free.
    let (queue, receiver) = server_channel(config.max_receive_queue);
    let (sender, mut events) = app_channel(16, Some(budget.clone()));
    let sender = if config.validate_events() {
        validating_sender(ScopeKind::WebSocket, sender)
    } else {
        sender
    };

    let app = ctx.core.app.clone();
    let app_task = tokio::spawn(async move { app.call(scope, receiver, sender).await });

    if !queue.push(ServerEvent::WebSocketConnect).await {
        // The application dropped its receiver before the handshake.
        return finish_failed_handshake(&ctx, app_task, &parts).await;
    }

    match events.next().await {
        Some(AppEvent::WebSocketAccept {
            subprotocol,
            headers,
        }) => {
            if let Some(proto) = &subprotocol {
                if !subprotocols.iter().any(|offered| offered == proto) {
                    tracing::debug!(
                        subprotocol = %proto,
                        "accepting a subprotocol the client did not offer"
                    );
                }
            }
            ctx.stats.set_mode(ConnMode::WebSocket);

            let mut response_headers = HeaderMap::new();
            let status = if is_h2 {
                // Extended CONNECT: acceptance is a plain 200.
                StatusCode::OK
            } else {
                response_headers
                    .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
                response_headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
                if let Some(key) = accept_key {
                    if let Ok(value) = HeaderValue::from_str(&key) {
                        response_headers.insert(header::SEC_WEBSOCKET_ACCEPT, value);
                    }
                }
                StatusCode::SWITCHING_PROTOCOLS
            };
            if let Some(proto) = &subprotocol {
                if let Ok(value) = HeaderValue::from_str(proto) {
                    response_headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
            for (name, value) in headers.iter() {
                response_headers.append(name, value.clone());
            }

            let finisher = finisher_for(&ctx, &parts, status, false, response_headers.clone());

            let pump_ctx = ctx.clone();
            let pump = tokio::spawn(async move {
                let io = match upgrade.await {
                    Ok(upgraded) => TokioIo::new(upgraded),
                    Err(err) => {
                        tracing::debug!(error = %err, "websocket upgrade failed");
                        queue.push(ServerEvent::WebSocketDisconnect {
                            code: CloseCode::ABNORMAL,
                        })
                        .await;
                        return;
                    }
                };
                let ws_config = WebSocketConfig::default()
                    .max_frame_size(Some(pump_ctx.core.config.max_ws_frame_size))
                    .max_message_size(Some(pump_ctx.core.config.max_ws_frame_size));
                let stream =
                    WebSocketStream::from_raw_socket(io, Role::Server, Some(ws_config)).await;
                pump(pump_ctx, stream, queue, events, budget).await;
                // The handler learns the session is over from its receive
                // stream; its task is left to finish on its own.
                drop(app_task);
            });
            *ctx.pump.lock().await = Some(pump);

            let mut response = Response::new(EventBody::empty(Some(finisher)));
            *response.status_mut() = status;
            *response.headers_mut() = response_headers;
            response
        }
        Some(AppEvent::WebSocketClose { code, reason }) => {
            tracing::debug!(%code, reason = %reason, "websocket handshake rejected by application");
            canned(&ctx, StatusCode::FORBIDDEN, "Forbidden", false, Some(&parts))
        }
        Some(other) => {
            tracing::debug!(event = other.name(), "unexpected event during websocket handshake");
            app_task.abort();
            canned(
                &ctx,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                false,
                Some(&parts),
            )
        }
        None => finish_failed_handshake(&ctx, app_task, &parts).await,
    }
}

async fn finish_failed_handshake(
    ctx: &Arc<ConnContext>,
    app_task: tokio::task::JoinHandle<Result<(), AppError>>,
    parts: &http::request::Parts,
) -> Response<EventBody> {
    match app_task.await {
        Ok(Err(AppError::Unsupported)) => {
            canned(ctx, StatusCode::NOT_FOUND, "Not Found", false, Some(parts))
        }
        Ok(Err(err)) => {
            tracing::error!(error = %err, "application error during websocket handshake");
            canned(
                ctx,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                false,
                Some(parts),
            )
        }
        Ok(Ok(())) | Err(_) => {
            tracing::debug!("application ended the websocket scope without accept or close");
            canned(
                ctx,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                false,
                Some(parts),
            )
        }
    }
}

/// The post-handshake framing loop.
async fn pump<S>(
    ctx: Arc<ConnContext>,
    mut stream: WebSocketStream<S>,
    queue: ServerEventQueue,
    mut events: AppEventQueue,
    budget: Arc<WriteBudget>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut shutdown = ctx.core.shutdown_rx();

    loop {
        if *shutdown.borrow_and_update() == Phase::Draining {
            close_with(&mut stream, CloseCode::GOING_AWAY, "server shutting down").await;
            queue
                .push(ServerEvent::WebSocketDisconnect {
                    code: CloseCode::GOING_AWAY,
                })
                .await;
            return;
        }
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let payload = WsPayload::Text(text.as_str().to_owned());
                    if !deliver(&ctx, &mut stream, &queue, payload).await {
                        return;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let payload = WsPayload::Binary(data);
                    if !deliver(&ctx, &mut stream, &queue, payload).await {
                        return;
                    }
                }
                // The framing layer answers pings on its own.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let code = frame
                        .map(|f| CloseCode(u16::from(f.code)))
                        .unwrap_or(CloseCode::NORMAL);
                    queue.push(ServerEvent::WebSocketDisconnect { code }).await;
                    return;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(WsError::Capacity(err))) => {
                    tracing::debug!(error = %err, "websocket frame over size limit");
                    close_with(&mut stream, CloseCode::PROTOCOL_ERROR, "frame too large").await;
                    queue.push(ServerEvent::WebSocketDisconnect {
                        code: CloseCode::PROTOCOL_ERROR,
                    })
                    .await;
                    return;
                }
                Some(Err(WsError::Protocol(err))) => {
                    tracing::debug!(error = %err, "websocket protocol violation");
                    close_with(&mut stream, CloseCode::PROTOCOL_ERROR, "protocol error").await;
                    queue.push(ServerEvent::WebSocketDisconnect {
                        code: CloseCode::PROTOCOL_ERROR,
                    })
                    .await;
                    return;
                }
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "websocket transport error");
                    queue.push(ServerEvent::WebSocketDisconnect {
                        code: CloseCode::ABNORMAL,
                    })
                    .await;
                    return;
                }
                None => {
                    queue.push(ServerEvent::WebSocketDisconnect {
                        code: CloseCode::ABNORMAL,
                    })
                    .await;
                    return;
                }
            },
            outgoing = events.next() => match outgoing {
                Some(AppEvent::WebSocketSend(payload)) => {
                    let cost = payload.len();
                    let message = match payload {
                        WsPayload::Text(text) => Message::Text(text.into()),
                        WsPayload::Binary(data) => Message::Binary(data),
                    };
                    let sent = stream.send(message).await;
                    budget.credit(cost);
                    if let Err(err) = sent {
                        tracing::debug!(error = %err, "websocket send failed");
                        queue.push(ServerEvent::WebSocketDisconnect {
                            code: CloseCode::ABNORMAL,
                        })
                        .await;
                        return;
                    }
                }
                Some(AppEvent::WebSocketClose { code, reason }) => {
                    close_with_reason(&mut stream, code, reason).await;
                    queue.push(ServerEvent::WebSocketDisconnect { code }).await;
                    return;
                }
                Some(other) => {
                    tracing::debug!(event = other.name(), "unexpected event on websocket scope");
                }
                None => {
                    // Handler returned without closing; end the session
                    // normally on its behalf.
                    close_with(&mut stream, CloseCode::NORMAL, "").await;
                    return;
                }
            },
            _ = shutdown.changed() => {}
        }
    }
}

/// Deliver an inbound message, enforcing the receive-queue cap.
async fn deliver<S>(
    _ctx: &Arc<ConnContext>,
    stream: &mut WebSocketStream<S>,
    queue: &ServerEventQueue,
    payload: WsPayload,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match queue.try_push(ServerEvent::WebSocketReceive(payload)) {
        Ok(()) => true,
        Err(_) => {
            tracing::debug!("websocket receive queue full; closing 1008");
            close_with(stream, CloseCode::POLICY_VIOLATION, "receive queue overflow").await;
            queue
                .push(ServerEvent::WebSocketDisconnect {
                    code: CloseCode::POLICY_VIOLATION,
                })
                .await;
            false
        }
    }
}

async fn close_with<S>(stream: &mut WebSocketStream<S>, code: CloseCode, reason: &str)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    close_with_reason(stream, code, reason.to_string()).await;
}

async fn close_with_reason<S>(stream: &mut WebSocketStream<S>, code: CloseCode, reason: String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: TungCloseCode::from(code.0),
        reason: reason.into(),
    };
    if let Err(err) = stream.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %err, "websocket close frame not delivered");
    }
}
