//! Minimal EventSub websocket endpoint: each accepted connection is welcomed
//! with a fresh session id (`mock-sess-<n>`) and then held open until the
//! client goes away. Connection and close counts are observable so tests can
//! assert on suspend/reconnect behavior.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;

#[derive(Default)]
struct MockEventSubState {
    connections: u64,
    closed: u64,
}

#[derive(Clone)]
struct Shared(Arc<Mutex<MockEventSubState>>);

pub struct MockEventSub {
    addr: SocketAddr,
    state: Arc<Mutex<MockEventSubState>>,
}

impl MockEventSub {
    pub async fn start() -> std::io::Result<MockEventSub> {
        let state = Arc::new(Mutex::new(MockEventSubState::default()));
        let router = Router::new()
            .route("/ws", get(upgrade))
            .with_state(Shared(Arc::clone(&state)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock eventsub server failed");
        });
        Ok(MockEventSub { addr, state })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// The session id the n-th accepted connection was welcomed with.
    pub fn session_id(n: u64) -> String {
        format!("mock-sess-{n}")
    }

    /// Total connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.state.lock().unwrap().connections
    }

    /// Connections the client side has closed or dropped.
    pub fn closed(&self) -> u64 {
        self.state.lock().unwrap().closed
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(shared): State<Shared>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, shared))
}

async fn serve_socket(mut socket: WebSocket, Shared(state): Shared) {
    let n = {
        let mut locked = state.lock().unwrap();
        locked.connections += 1;
        locked.connections
    };
    let welcome = json!({
        "metadata": {
            "message_id": format!("welcome-{n}"),
            "message_type": "session_welcome",
            "message_timestamp": "2026-02-17T00:00:00Z",
        },
        "payload": {
            "session": {
                "id": MockEventSub::session_id(n),
                "keepalive_timeout_seconds": 10,
            },
        },
    });
    if socket.send(Message::Text(welcome.to_string())).await.is_ok() {
        while let Some(Ok(frame)) = socket.recv().await {
            if matches!(frame, Message::Close(_)) {
                break;
            }
        }
    }
    state.lock().unwrap().closed += 1;
}
