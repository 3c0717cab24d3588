//! Upstream-WS session machine.
//!
//! One connection at a time. The receive loop uses a short per-receive
//! timeout so the cooldown predicate is re-checked cooperatively without
//! out-of-band wakeups. Welcome frames drive a reconcile plus a full ensure
//! pass; reconnect frames move the connection to the advertised URL while
//! subscriptions rotate lazily through the ensurer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use es_protocol::{RawFrame, SessionFrame, UPSTREAM_CLOSE_UNUSED};
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::notify::IncomingTransport;
use super::EventSubManager;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Per-receive timeout; bounds how stale the cooldown check can get.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
/// A fresh connection must produce its welcome frame within this window.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(15);
/// Backoff after transport errors.
const ERROR_BACKOFF: Duration = Duration::from_secs(3);
/// Poll interval while there is nothing to connect for.
const IDLE_POLL: Duration = Duration::from_secs(5);

enum ConnectionExit {
    /// Cooldown elapsed; socket closed, session cleared.
    Suspend,
    /// Upstream asked us to move to this URL.
    Reconnect(String),
    /// Stop flag observed.
    Stopped,
}

#[derive(Debug)]
enum SessionError {
    Connect(String),
    Socket(String),
    /// Remote close 4003: Twitch dropped an idle, subscription-less socket.
    ClosedUnused,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Connect(s) => write!(f, "connect error: {s}"),
            SessionError::Socket(s) => write!(f, "socket error: {s}"),
            SessionError::ClosedUnused => write!(f, "closed as unused (4003)"),
        }
    }
}

impl EventSubManager {
    pub(crate) async fn run_session_loop(self: Arc<Self>) {
        let mut reconnect_url: Option<String> = None;
        while !self.stopped() {
            if !self.has_websocket_interest() {
                self.set_session(None);
                self.reset_cooldown_clock();
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            if let Some(remaining) = self.ws_cooldown_remaining().await {
                if remaining <= ChronoDuration::zero() {
                    info!(
                        cooldown_secs = self.settings.tunables.ws_listener_cooldown.as_secs(),
                        "no downstream websocket listeners; suspending upstream connection"
                    );
                    self.set_session(None);
                    tokio::time::sleep(IDLE_POLL).await;
                    continue;
                }
            }
            let url =
                reconnect_url.take().unwrap_or_else(|| self.twitch.eventsub_ws_url.clone());
            match self.run_single_connection(&url).await {
                Ok(ConnectionExit::Suspend) => {}
                Ok(ConnectionExit::Reconnect(next)) => {
                    reconnect_url = Some(next);
                }
                Ok(ConnectionExit::Stopped) => return,
                Err(SessionError::ClosedUnused) => {
                    info!("upstream closed the websocket as unused; waiting for interests");
                    self.set_session(None);
                    tokio::time::sleep(IDLE_POLL).await;
                }
                Err(err) => {
                    warn!(error = %err, "upstream websocket failed; backing off");
                    self.set_session(None);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn run_single_connection(&self, url: &str) -> Result<ConnectionExit, SessionError> {
        let (mut ws, _response) =
            connect_async(url).await.map_err(|e| SessionError::Connect(e.to_string()))?;
        info!(%url, "upstream websocket connected");
        let connected_at = tokio::time::Instant::now();
        let mut saw_welcome = false;
        loop {
            if self.stopped() {
                let _ = ws.close(None).await;
                return Ok(ConnectionExit::Stopped);
            }
            if let Some(remaining) = self.ws_cooldown_remaining().await {
                if remaining <= ChronoDuration::zero() {
                    info!(
                        cooldown_secs = self.settings.tunables.ws_listener_cooldown.as_secs(),
                        "no downstream websocket listeners; suspending upstream connection"
                    );
                    let _ = ws.close(None).await;
                    self.set_session(None);
                    return Ok(ConnectionExit::Suspend);
                }
            }
            let message = match tokio::time::timeout(RECEIVE_TIMEOUT, ws.next()).await {
                Err(_) => {
                    if !saw_welcome && connected_at.elapsed() >= WELCOME_TIMEOUT {
                        let _ = ws.close(None).await;
                        return Err(SessionError::Socket(
                            "no welcome frame within the handshake window".to_owned(),
                        ));
                    }
                    continue;
                }
                Ok(None) => return Err(SessionError::Socket("connection ended".to_owned())),
                Ok(Some(Err(err))) => return Err(SessionError::Socket(err.to_string())),
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Text(text) => {
                    let raw: RawFrame = match serde_json::from_str(text.as_str()) {
                        Ok(raw) => raw,
                        Err(err) => {
                            debug!(error = %err, "dropping unparsable upstream frame");
                            continue;
                        }
                    };
                    if raw.metadata.message_type == "session_welcome" {
                        saw_welcome = true;
                    }
                    if let Some(exit) = self.handle_frame(&mut ws, raw).await? {
                        return Ok(exit);
                    }
                }
                Message::Close(frame) => {
                    if let Some(frame) = &frame {
                        if u16::from(frame.code) == UPSTREAM_CLOSE_UNUSED {
                            return Err(SessionError::ClosedUnused);
                        }
                    }
                    return Err(SessionError::Socket(format!(
                        "remote close: {}",
                        frame.map(|f| u16::from(f.code).to_string()).unwrap_or_default()
                    )));
                }
                // tungstenite answers pings during read; nothing else matters here
                _ => {}
            }
        }
    }

    async fn handle_frame(
        &self,
        ws: &mut WsStream,
        raw: RawFrame,
    ) -> Result<Option<ConnectionExit>, SessionError> {
        match SessionFrame::classify(raw) {
            SessionFrame::Welcome { session } => {
                info!(session_id = %session.id, "upstream session established");
                self.set_session(Some(session.id));
                if let Err(err) = self.sync_from_twitch_and_reconcile().await {
                    warn!(error = %err, "reconcile on welcome failed");
                }
                self.ensure_all_subscriptions().await;
                self.refresh_stream_states_for_active_subscriptions().await;
                self.refresh_stream_states_for_interested_channels().await;
            }
            SessionFrame::Reconnect { session } => {
                if let Some(next) = session.reconnect_url {
                    info!(%next, "upstream requested session reconnect");
                    let _ = ws.close(None).await;
                    return Ok(Some(ConnectionExit::Reconnect(next)));
                }
            }
            SessionFrame::Notification { message_id, payload } => {
                // Twitch may redeliver over the socket too; same dedupe set
                // as the webhook ingress.
                if !self.deduper.is_new(&message_id) {
                    debug!(%message_id, "dropping duplicate websocket notification");
                    return Ok(None);
                }
                self.handle_notification(&payload, &message_id, IncomingTransport::Websocket)
                    .await;
            }
            SessionFrame::Revocation { payload } => {
                self.handle_revocation(&payload).await;
            }
            SessionFrame::Keepalive => {}
            SessionFrame::Unknown { message_type } => {
                debug!(%message_type, "dropping unknown upstream frame");
            }
        }
        Ok(None)
    }
}
