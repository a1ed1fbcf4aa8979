use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use cc_executor_error::ExecutorError;
use cc_executor_protocol::{
    ConnectionInfo, Envelope, PingParams, Response, ServerNotification, CAPABILITIES,
    PROTOCOL_VERSION,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::dispatcher;
use crate::router::AppState;
use crate::session::{Attachment, CloseReason, Session};

/// Query parameters of the WebSocket upgrade. Both are present to resume a
/// session and both absent to start a new one.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConnectQuery {
    pub session_id: Option<String>,
    pub reconnect_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    ClientClosed,
    TransportLost,
    HeartbeatTimeout,
    QueueOverflow,
    Displaced,
    SessionClosed,
}

type Writer = SplitSink<WebSocket, Message>;

pub(crate) async fn serve_socket(state: Arc<AppState>, mut socket: WebSocket, query: ConnectQuery) {
    let (session, attachment) = match resolve(&state, query).await {
        Ok(resolved) => resolved,
        Err(err) => {
            tracing::warn!(error = %err, "rejecting connection");
            reject(&mut socket, &err).await;
            return;
        }
    };

    let Attachment {
        epoch,
        resumed,
        replayed,
        displaced,
    } = attachment;
    tracing::info!(
        session_id = %session.id(),
        epoch,
        resumed,
        replayed,
        "client connected"
    );

    let greeting = ServerNotification::Connected(ConnectionInfo {
        session_id: session.id().to_string(),
        version: PROTOCOL_VERSION.to_string(),
        capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        reconnect_token: session.reconnect_token().to_string(),
        resumed,
        replayed,
    });

    let (sink, mut stream) = socket.split();
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(
        state.clone(),
        session.clone(),
        sink,
        greeting,
        displaced,
        stop_rx,
    ));

    let end = loop {
        tokio::select! {
            joined = &mut writer => {
                break joined.unwrap_or(ConnectionEnd::TransportLost);
            }
            frame = stream.next() => {
                let end = match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatcher::handle_frame(&state, &session, &text).await;
                        continue;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        dispatcher::reject_frame(&state, &session, "binary frames are not supported");
                        continue;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => ConnectionEnd::ClientClosed,
                    Some(Err(err)) => {
                        tracing::debug!(session_id = %session.id(), error = %err, "websocket read failed");
                        ConnectionEnd::TransportLost
                    }
                    None => ConnectionEnd::TransportLost,
                };
                let _ = stop_tx.send(());
                if tokio::time::timeout(state.config().drain_timeout, &mut writer)
                    .await
                    .is_err()
                {
                    writer.abort();
                }
                break end;
            }
        }
    };

    tracing::info!(session_id = %session.id(), epoch, end = ?end, "client disconnected");
    let sessions = state.sessions();
    match end {
        ConnectionEnd::ClientClosed => sessions.close(&session, CloseReason::ClientClosed).await,
        ConnectionEnd::QueueOverflow => sessions.close(&session, CloseReason::QueueOverflow).await,
        ConnectionEnd::TransportLost | ConnectionEnd::HeartbeatTimeout => {
            if session.detach(epoch) {
                sessions.schedule_expiry(session.clone(), epoch);
            }
        }
        ConnectionEnd::Displaced | ConnectionEnd::SessionClosed => {}
    }
}

async fn resolve(
    state: &AppState,
    query: ConnectQuery,
) -> Result<(Arc<Session>, Attachment), ExecutorError> {
    let sessions = state.sessions();
    let session = match (query.session_id, query.reconnect_token) {
        (Some(id), Some(token)) => sessions.resume(&id, &token).await?,
        (None, None) => sessions.open().await?,
        _ => {
            return Err(ExecutorError::InvalidRequest {
                message: "session_id and reconnect_token must be given together".to_string(),
            })
        }
    };
    let attachment = session.attach()?;
    Ok((session, attachment))
}

async fn reject(socket: &mut WebSocket, err: &ExecutorError) {
    let response = Envelope::from(Response::error(None, err)).to_text();
    let _ = socket.send(Message::Text(response)).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Cow::Borrowed(err.error_type().title()),
        })))
        .await;
}

/// Owns the sending half of the socket. Sends the greeting, replays and then
/// streams the session outbox, and drives the heartbeat. Pings are written
/// directly and never queued.
async fn write_loop(
    state: Arc<AppState>,
    session: Arc<Session>,
    mut sink: Writer,
    greeting: ServerNotification,
    mut displaced: oneshot::Receiver<()>,
    mut stop: oneshot::Receiver<()>,
) -> ConnectionEnd {
    let config = state.config();
    let greeting = match encode(&greeting) {
        Some(text) => text,
        None => return ConnectionEnd::TransportLost,
    };
    match tokio::time::timeout(config.handshake_timeout, sink.send(Message::Text(greeting))).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::debug!(session_id = %session.id(), error = %err, "failed to send greeting");
            return ConnectionEnd::TransportLost;
        }
        Err(_) => {
            tracing::warn!(session_id = %session.id(), "greeting timed out");
            return ConnectionEnd::TransportLost;
        }
    }

    let mut ping = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    let outbox = session.outbox();

    loop {
        while let Some(message) = outbox.try_pop() {
            if let Err(err) = sink.send(Message::Text(message.payload.clone())).await {
                tracing::debug!(
                    session_id = %session.id(),
                    sequence = message.sequence,
                    error = %err,
                    "send failed; keeping message for replay"
                );
                outbox.requeue_front(message);
                return ConnectionEnd::TransportLost;
            }
        }

        if outbox.is_closed() {
            let (code, reason, end) = if outbox.is_overflowed() {
                (close_code::ERROR, "outbound queue overflow", ConnectionEnd::QueueOverflow)
            } else {
                (close_code::AWAY, "session closed", ConnectionEnd::SessionClosed)
            };
            close(&mut sink, code, reason).await;
            return end;
        }

        let heartbeat_deadline = session.last_pong() + config.heartbeat_timeout;
        tokio::select! {
            _ = outbox.notified() => {}
            _ = ping.tick() => {
                let Some(text) = encode(&ServerNotification::Ping(PingParams {
                    timestamp: format_timestamp(),
                })) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    return ConnectionEnd::TransportLost;
                }
            }
            _ = tokio::time::sleep_until(heartbeat_deadline) => {
                let silent = session.last_pong().elapsed();
                if silent >= config.heartbeat_timeout {
                    tracing::warn!(
                        session_id = %session.id(),
                        silent_ms = silent.as_millis() as u64,
                        "heartbeat timed out"
                    );
                    close(&mut sink, close_code::AWAY, "heartbeat timeout").await;
                    return ConnectionEnd::HeartbeatTimeout;
                }
            }
            _ = &mut displaced => {
                // A closed session is handled at the top of the loop.
                if !outbox.is_closed() {
                    close(&mut sink, close_code::NORMAL, "replaced by a newer connection").await;
                    return ConnectionEnd::Displaced;
                }
            }
            _ = &mut stop => return ConnectionEnd::TransportLost,
        }
    }
}

async fn close(sink: &mut Writer, code: u16, reason: &'static str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}

fn encode(notification: &ServerNotification) -> Option<String> {
    match notification.to_notification() {
        Ok(notification) => Some(Envelope::from(notification).to_text()),
        Err(err) => {
            tracing::error!(method = notification.method(), error = %err, "failed to encode notification");
            None
        }
    }
}

fn format_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
