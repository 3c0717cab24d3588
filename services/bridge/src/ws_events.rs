//! Downstream consumer WebSocket endpoint: `GET /ws/events?ws_token=...`.
//!
//! The handshake gates on client IP, then a single-use token minted by
//! `POST /v1/ws-token`. Accepted sockets only ever receive; inbound frames
//! are proxy keepalive and are discarded. A writer half drains the hub queue
//! so fan-out never blocks on a slow socket.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use es_protocol::{WS_CLOSE_IP_BLOCKED, WS_CLOSE_UNAUTHORIZED};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::net;
use crate::repo::consumers;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsEventsQuery {
    #[serde(default)]
    pub ws_token: Option<String>,
}

pub async fn ws_events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsEventsQuery>,
) -> impl IntoResponse {
    let client_ip = net::resolve_client_ip(
        Some(&addr.ip().to_string()),
        headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
        state.settings.app_trust_x_forwarded_for,
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_ip, query.ws_token))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: Cow::Borrowed(reason) })))
        .await;
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    client_ip: Option<String>,
    ws_token: Option<String>,
) {
    if !net::is_ip_allowed(client_ip.as_deref(), &state.allowed_networks) {
        warn!(client_ip = client_ip.as_deref().unwrap_or("unknown"),
            "blocked websocket connection by IP");
        close_with(socket, WS_CLOSE_IP_BLOCKED, "ip not allowed").await;
        return;
    }
    // Browsers hand us the literal strings "undefined"/"null" for an unset
    // variable; treat them as absent.
    let token = ws_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty() && !matches!(t.to_ascii_lowercase().as_str(), "undefined" | "null"))
        .map(str::to_owned);
    let Some(token) = token else {
        close_with(socket, WS_CLOSE_UNAUTHORIZED, "ws_token required").await;
        return;
    };
    let Some(consumer_id) = state.ws_tokens.consume(&token) else {
        close_with(socket, WS_CLOSE_UNAUTHORIZED, "invalid or expired ws_token").await;
        return;
    };
    let consumer = match consumers::get(&state.pool, consumer_id).await {
        Ok(Some(consumer)) if consumer.enabled => consumer,
        Ok(_) => {
            close_with(socket, WS_CLOSE_UNAUTHORIZED, "consumer unavailable").await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "consumer lookup failed during ws handshake");
            close_with(socket, WS_CLOSE_UNAUTHORIZED, "consumer unavailable").await;
            return;
        }
    };

    info!(consumer_id = %consumer.id, "accepted /ws/events connection");
    state
        .manager
        .record_trace(
            consumer.id,
            "incoming",
            "websocket",
            "service.ws.connect",
            Some("/ws/events"),
            &json!({
                "auth_mode": "ws_token",
                "client_ip": client_ip,
            }),
        )
        .await;

    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Message>();
    let connection_id = state.hub.connect(consumer.id, queue_tx).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            queued = queue_rx.recv() => match queued {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                // Keepalive only; consumer frames carry no protocol.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.hub.disconnect(consumer.id, connection_id).await;
    state
        .manager
        .record_trace(
            consumer.id,
            "incoming",
            "websocket",
            "service.ws.disconnect",
            Some("/ws/events"),
            &json!({"client_ip": client_ip}),
        )
        .await;
    info!(consumer_id = %consumer.id, "closed /ws/events connection");
}
