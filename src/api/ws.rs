//! Websocket surface (spec.md §6.2): `/activities/session/:id/stream`.
//!
//! The handshake authenticates via a `?token=` query parameter rather than
//! an `Authorization` header, since browsers cannot set custom headers on a
//! websocket upgrade request. A permit (granted by the HTTP `join` handler)
//! must already be on file for `(sessionId, userId)` or the socket is
//! accepted and immediately closed with 4403 — rejecting the upgrade outright
//! would not let us deliver that close code.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::auth::{parse_query_token, AuthSecret};
use crate::coordinator::Coordinator;
use crate::errors::{ErrorFrame, ErrorKind};
use crate::wire::{AckPayload, InboundFrame, OutboundEvent};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: String,
}

pub async fn stream(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<Coordinator>>,
    State(auth_secret): State<AuthSecret>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let Some(auth) = parse_query_token(&auth_secret.0, &query.token) else {
        return ws.on_upgrade(|socket| close_immediately(socket, 4401, "unauthorized"));
    };
    if coordinator.load(session_id).is_err() {
        return ws.on_upgrade(|socket| close_immediately(socket, 1008, "session_not_found"));
    }

    ws.on_upgrade(move |socket| handle_socket(socket, coordinator, session_id, auth.user_id))
}

async fn close_immediately(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(mut socket: WebSocket, coordinator: Arc<Coordinator>, session_id: Uuid, user_id: String) {
    let (socket_id, mut outbound_rx) = match coordinator.attach_stream(session_id, &user_id).await {
        Ok(attached) => attached,
        Err(err) => {
            let code = match err.kind {
                ErrorKind::NotJoined => 4403,
                ErrorKind::SessionNotFound => 1008,
                _ => 1011,
            };
            close_immediately(socket, code, err.kind.code()).await;
            return;
        }
    };

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if socket.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&coordinator, session_id, &user_id, &text, &mut socket).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    coordinator.detach_stream(session_id, socket_id);
    debug!(%session_id, %user_id, "websocket detached");
}

/// Decodes one inbound text frame and replies directly to this socket
/// (ack/pong/error) — these are per-caller responses, not broadcast events,
/// so they bypass the Socket Hub entirely.
async fn handle_inbound(coordinator: &Arc<Coordinator>, session_id: Uuid, user_id: &str, text: &str, socket: &mut WebSocket) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            reply(
                socket,
                &OutboundEvent::Error(ErrorFrame {
                    code: "bad_format",
                    details: Some(err.to_string()),
                }),
            )
            .await;
            return;
        }
    };

    match frame {
        InboundFrame::Ping(payload) => match coordinator.ping(session_id, user_id, payload.client_time_ms).await {
            Ok(pong) => reply(socket, &OutboundEvent::Pong(pong)).await,
            Err(err) => reply(socket, &OutboundEvent::Error(err.into())).await,
        },
        InboundFrame::Keystroke(payload) => {
            let result = coordinator
                .keystroke(session_id, user_id, payload.client_time_ms, payload.length, payload.paste)
                .await;
            match result {
                Ok(()) => reply(socket, &OutboundEvent::Ack(AckPayload { for_type: "keystroke" })).await,
                Err(err) => reply(socket, &OutboundEvent::Error(err.into())).await,
            }
        }
        InboundFrame::Submit(payload) => match coordinator.submit(session_id, user_id, payload).await {
            Ok(()) => reply(socket, &OutboundEvent::Ack(AckPayload { for_type: "submit" })).await,
            Err(err) => reply(socket, &OutboundEvent::Error(err.into())).await,
        },
    }
}

async fn reply(socket: &mut WebSocket, event: &OutboundEvent) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = socket.send(Message::Text(text)).await;
    }
}
