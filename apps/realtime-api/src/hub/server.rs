//! WebSocket upgrade handler and the per-session reader, writer and
//! heartbeat tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;

use crate::auth::tokens::{self, TOKEN_HEADER};
use crate::error::{ApiError, HandshakeError};
use crate::AppState;

use super::events::{ClientMessage, HubMessage};
use super::registry::{Hub, HubConfig, NOTIFICATIONS_HUB};
use super::session::{CloseReason, Outbound, Session};

/// How long the writer gets to flush its close frame once a session ends.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Hub to join; defaults to notifications.
    pub hub: Option<String>,
    /// Link token, for clients that cannot set the `jwt` header.
    pub token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/{id}", get(ws_upgrade))
}

async fn ws_upgrade(
    Path(user_id): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    // Authenticate before upgrading so a failed attempt has no side effects.
    let hub = handshake(&state, &user_id, &params, &headers)?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws
        .on_upgrade(move |socket| open_session(socket, hub, user_id))
        .into_response())
}

fn handshake(
    state: &AppState,
    user_id: &str,
    params: &ConnectParams,
    headers: &HeaderMap,
) -> Result<Arc<Hub>, HandshakeError> {
    if !state.supervisor.healthy() {
        return Err(HandshakeError::ShuttingDown);
    }

    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(params.token.as_deref())
        .ok_or(HandshakeError::MissingToken)?;
    tokens::authenticate(&state.config.hub_secret, token, user_id)?;

    let hub = state
        .supervisor
        .hub(params.hub.as_deref().unwrap_or(NOTIFICATIONS_HUB))?;
    if hub.is_draining() {
        return Err(HandshakeError::ShuttingDown);
    }
    Ok(hub)
}

/// Bring an upgraded socket into the hub and run it until it closes.
async fn open_session(mut socket: WebSocket, hub: Arc<Hub>, user_id: String) {
    let config = hub.config().clone();
    let (session, outbound_rx) = Session::new(hub.name(), &user_id, config.queue_capacity);

    if !session.activate() || !hub.register(&session) {
        // The hub started draining after the handshake.
        let reason = CloseReason::Shutdown;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: reason.code(),
                reason: reason.as_str().into(),
            })))
            .await;
        return;
    }

    tracing::info!(
        hub = %hub.name(),
        session_id = %session.session_id,
        user_id = %session.user_id,
        "link established"
    );

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(session.clone(), ws_tx, outbound_rx));
    let reader = tokio::spawn(read_loop(session.clone(), hub.clone(), ws_rx));
    let heartbeat = tokio::spawn(heartbeat_loop(session.clone(), config));

    // Any of the three tasks, a kick, or a drain closes the session.
    session.closed().await;
    hub.unregister(&session);

    let writer_abort = writer.abort_handle();
    if time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        writer_abort.abort();
    }
    reader.abort();
    heartbeat.abort();

    tracing::info!(
        hub = %hub.name(),
        session_id = %session.session_id,
        user_id = %session.user_id,
        reason = session.close_reason().map(CloseReason::as_str).unwrap_or("unknown"),
        dropped = session.dropped_count(),
        "link closed"
    );
}

/// Decode inbound frames until the client leaves or the session closes.
async fn read_loop(session: Arc<Session>, hub: Arc<Hub>, mut ws_rx: WsStream) {
    loop {
        tokio::select! {
            _ = session.closed() => break,

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.touch();
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                tracing::debug!(session_id = %session.session_id, "ignoring invalid JSON frame");
                                continue;
                            }
                        };
                        match hub.inbound_handler() {
                            Some(handler) => handler.on_message(&session, client_msg),
                            None => tracing::debug!(
                                hub = %hub.name(),
                                op = client_msg.op,
                                "hub has no inbound handler, frame ignored"
                            ),
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {
                        session.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        session.close(CloseReason::ClientClosed);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                        session.close(CloseReason::Transport);
                        break;
                    }
                }
            }
        }
    }
}

/// Drain the outbound queue in order. A send stuck on a client that stopped
/// reading is abandoned as soon as the session closes.
async fn write_loop(
    session: Arc<Session>,
    mut ws_tx: WsSink,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = session.closed() => break,

            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => {
                    session.close(CloseReason::Transport);
                    break;
                }
            },
        };

        let msg = match frame {
            Outbound::Event(event) => encode(&session, &event.to_message()),
            Outbound::Closing(reason) => encode(&session, &HubMessage::closing(reason)),
            Outbound::Ping => Some(Message::Ping(Bytes::new())),
        };
        let Some(msg) = msg else { continue };

        tokio::select! {
            _ = session.closed() => break,

            sent = ws_tx.send(msg) => {
                if sent.is_err() {
                    session.close(CloseReason::Transport);
                    break;
                }
            }
        }
    }

    if let Some(reason) = session.close_reason() {
        if reason != CloseReason::Transport {
            let _ = send_close(&mut ws_tx, reason.code(), reason.as_str()).await;
        }
    }
}

fn encode(session: &Session, msg: &HubMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(err) => {
            tracing::warn!(?err, session_id = %session.session_id, "failed to encode frame");
            None
        }
    }
}

/// Ping on every interval and force-close the session once the client has
/// been silent longer than the timeout, whatever the writer is doing.
async fn heartbeat_loop(session: Arc<Session>, config: HubConfig) {
    let mut ticker = time::interval(config.heartbeat_interval);
    ticker.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            _ = session.closed() => break,

            _ = ticker.tick() => {
                if session.idle_for() > config.heartbeat_timeout {
                    tracing::debug!(
                        session_id = %session.session_id,
                        "heartbeat timeout, closing connection"
                    );
                    session.close(CloseReason::HeartbeatTimeout);
                    break;
                }
                session.ping();
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
