//! Upstream webhook ingress: Twitch POSTs EventSub messages here.
//!
//! Order of operations per request: verify the HMAC signature over
//! (message id || timestamp || raw body), dedupe on the message id, then
//! dispatch on the message type. Challenges are answered synchronously;
//! notification processing runs detached so Twitch gets its 204 quickly.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use es_protocol::NotificationPayload;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, warn};

use super::response::{forbidden, json_error};
use crate::eventsub::notify::IncomingTransport;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Constant-time check of the `Twitch-Eventsub-Message-Signature` header.
pub fn verify_twitch_signature(
    secret: &str,
    message_id: &str,
    message_timestamp: &str,
    raw_body: &[u8],
    signature_header: &str,
) -> bool {
    let Some(hex_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(presented) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message_id.as_bytes());
    mac.update(message_timestamp.as_bytes());
    mac.update(raw_body);
    mac.verify_slice(&presented).is_ok()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn challenge_response(payload: &Value) -> Response {
    let challenge =
        payload.get("challenge").and_then(Value::as_str).unwrap_or("").to_owned();
    (StatusCode::OK, challenge).into_response()
}

pub async fn twitch_eventsub_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = state.settings.twitch_eventsub_webhook_secret.clone() else {
        return json_error(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "webhook ingress is not configured",
        );
    };
    let message_id = header_value(&headers, "twitch-eventsub-message-id").to_owned();
    let message_timestamp = header_value(&headers, "twitch-eventsub-message-timestamp");
    let signature = header_value(&headers, "twitch-eventsub-message-signature");
    if !verify_twitch_signature(&secret, &message_id, message_timestamp, &body, signature) {
        warn!(%message_id, "rejected webhook POST with invalid signature");
        return forbidden("Invalid Twitch signature");
    }
    let message_type =
        header_value(&headers, "twitch-eventsub-message-type").to_ascii_lowercase();
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%message_id, error = %err, "webhook POST body is not JSON");
            return StatusCode::NO_CONTENT.into_response();
        }
    };

    if !state.deduper.is_new(&message_id) {
        // Challenges are answered even on redelivery; everything else is
        // swallowed.
        if message_type == "webhook_callback_verification" {
            return challenge_response(&payload);
        }
        debug!(%message_id, "dropping duplicate webhook message");
        return StatusCode::NO_CONTENT.into_response();
    }

    match message_type.as_str() {
        "webhook_callback_verification" => challenge_response(&payload),
        "notification" => {
            match serde_json::from_value::<NotificationPayload>(payload) {
                Ok(notification) => {
                    let manager = Arc::clone(&state.manager);
                    tokio::spawn(async move {
                        manager
                            .handle_notification(
                                &notification,
                                &message_id,
                                IncomingTransport::Webhook,
                            )
                            .await;
                    });
                }
                Err(err) => {
                    warn!(%message_id, error = %err, "unparsable webhook notification")
                }
            }
            StatusCode::NO_CONTENT.into_response()
        }
        "revocation" => {
            match serde_json::from_value::<NotificationPayload>(payload) {
                Ok(revocation) => {
                    let manager = Arc::clone(&state.manager);
                    tokio::spawn(async move {
                        manager.handle_revocation(&revocation).await;
                    });
                }
                Err(err) => warn!(%message_id, error = %err, "unparsable webhook revocation"),
            }
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(message_id.as_bytes());
        mac.update(timestamp.as_bytes());
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"challenge":"abc"}"#;
        let header = sign("s3cr3t-long-enough", "m1", "2026-02-17T00:00:00Z", body);
        assert!(verify_twitch_signature(
            "s3cr3t-long-enough",
            "m1",
            "2026-02-17T00:00:00Z",
            body,
            &header
        ));
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign("s3cr3t-long-enough", "m1", "2026-02-17T00:00:00Z", b"original");
        assert!(!verify_twitch_signature(
            "s3cr3t-long-enough",
            "m1",
            "2026-02-17T00:00:00Z",
            b"tampered",
            &header
        ));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign("secret-one-aaaa", "m1", "t", b"body");
        assert!(!verify_twitch_signature("secret-two-bbbb", "m1", "t", b"body", &header));
    }

    #[test]
    fn malformed_headers_fail_closed() {
        assert!(!verify_twitch_signature("secret", "m1", "t", b"body", ""));
        assert!(!verify_twitch_signature("secret", "m1", "t", b"body", "sha256=zz-not-hex"));
        assert!(!verify_twitch_signature("secret", "m1", "t", b"body", "md5=abcd"));
    }
}
