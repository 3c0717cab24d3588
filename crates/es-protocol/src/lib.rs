// es-protocol: wire types shared between the bridge and its peers.
//
// Two directions live here: the frames Twitch EventSub delivers over its
// websocket (discriminated by `metadata.message_type`), and the envelopes the
// bridge delivers to downstream consumers.  Consumer-facing shapes are frozen;
// unknown upstream fields are carried through untouched inside `event`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Provider tag for envelopes carrying real Twitch events.
pub const PROVIDER_TWITCH: &str = "twitch";
/// Provider tag for envelopes synthesized by the bridge itself.
pub const PROVIDER_BRIDGE: &str = "twitch-service";

/// Synthetic envelope type emitted when a subscription cannot be ensured.
pub const TYPE_SUBSCRIPTION_ERROR: &str = "subscription.error";
/// Synthetic envelope type emitted when an interest is rejected and removed.
pub const TYPE_INTEREST_REJECTED: &str = "interest.rejected";

/// Downstream WS close code: authentication failure.
pub const WS_CLOSE_UNAUTHORIZED: u16 = 4401;
/// Downstream WS close code: client IP not in the allow list.
pub const WS_CLOSE_IP_BLOCKED: u16 = 4403;
/// Upstream close code Twitch uses for an idle, subscription-less socket.
pub const UPSTREAM_CLOSE_UNUSED: u16 = 4003;

// ---------------------------------------------------------------------------
// Consumer-facing envelope
// ---------------------------------------------------------------------------

/// The fixed shape in which events reach downstream consumers.
///
/// `event` is the upstream event object, unmodified.  `twitch_chat_assets`
/// is attached only on `channel.chat.*` events and only when enrichment
/// produced something; consumers must tolerate its absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Upstream message id, or a freshly minted hex id for synthetic events.
    pub id: String,
    pub provider: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub event: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitch_chat_assets: Option<Value>,
}

/// Structured body of a `subscription.error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionErrorEvent {
    pub error_code: String,
    pub reason: String,
    pub hint: String,
    pub event_type: String,
    pub broadcaster_user_id: String,
    pub bot_account_id: Uuid,
    /// `"websocket"` or `"webhook"` — the upstream transport that failed.
    pub upstream_transport: String,
}

/// Structured body of an `interest.rejected` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestRejectedEvent {
    pub interest_id: Uuid,
    pub consumer_id: Uuid,
    pub bot_account_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
    pub upstream_transport: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// JSON body for every non-2xx HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

// ---------------------------------------------------------------------------
// Upstream EventSub frames (Twitch -> bridge, websocket)
// ---------------------------------------------------------------------------

/// Metadata block present on every EventSub websocket frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub message_timestamp: Option<String>,
}

/// A frame as received off the wire: metadata plus an uninterpreted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    #[serde(default = "FrameMetadata::empty")]
    pub metadata: FrameMetadata,
    #[serde(default)]
    pub payload: Value,
}

impl FrameMetadata {
    fn empty() -> Self {
        FrameMetadata {
            message_id: String::new(),
            message_type: String::new(),
            message_timestamp: None,
        }
    }
}

/// `payload.session` on welcome and reconnect frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub reconnect_url: Option<String>,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
}

/// Upstream subscription metadata carried inside notifications and
/// revocations.  `condition` keys beyond the two the bridge routes on are
/// preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionMeta {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub condition: SubscriptionCondition,
    #[serde(default)]
    pub transport: Option<TransportMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMeta {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

/// `payload` of a notification frame (and of a webhook notification POST).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub subscription: SubscriptionMeta,
    #[serde(default)]
    pub event: Value,
}

/// A frame after discrimination on `metadata.message_type`.
///
/// Shapes Twitch has not documented (or adds later) land in `Unknown` and are
/// dropped by the session machine without tearing the connection down.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionFrame {
    Welcome { session: SessionInfo },
    Keepalive,
    Notification {
        message_id: String,
        payload: NotificationPayload,
    },
    Reconnect { session: SessionInfo },
    Revocation { payload: NotificationPayload },
    Unknown { message_type: String },
}

impl SessionFrame {
    /// Classify a raw frame.  Malformed payloads for a known `message_type`
    /// degrade to `Unknown` rather than erroring.
    pub fn classify(raw: RawFrame) -> SessionFrame {
        fn session_of(payload: &Value) -> Option<SessionInfo> {
            serde_json::from_value(payload.get("session")?.clone()).ok()
        }
        match raw.metadata.message_type.as_str() {
            "session_welcome" => match session_of(&raw.payload) {
                Some(session) => SessionFrame::Welcome { session },
                None => SessionFrame::Unknown {
                    message_type: raw.metadata.message_type,
                },
            },
            "session_keepalive" => SessionFrame::Keepalive,
            "session_reconnect" => match session_of(&raw.payload) {
                Some(session) => SessionFrame::Reconnect { session },
                None => SessionFrame::Unknown {
                    message_type: raw.metadata.message_type,
                },
            },
            "notification" => match serde_json::from_value(raw.payload) {
                Ok(payload) => SessionFrame::Notification {
                    message_id: raw.metadata.message_id,
                    payload,
                },
                Err(_) => SessionFrame::Unknown {
                    message_type: raw.metadata.message_type,
                },
            },
            "revocation" => match serde_json::from_value(raw.payload) {
                Ok(payload) => SessionFrame::Revocation { payload },
                Err(_) => SessionFrame::Unknown {
                    message_type: raw.metadata.message_type,
                },
            },
            other => SessionFrame::Unknown {
                message_type: other.to_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(message_type: &str, payload: Value) -> RawFrame {
        RawFrame {
            metadata: FrameMetadata {
                message_id: "m-1".to_owned(),
                message_type: message_type.to_owned(),
                message_timestamp: Some("2026-02-17T00:00:00Z".to_owned()),
            },
            payload,
        }
    }

    #[test]
    fn welcome_frame_carries_session_id() {
        let raw = frame(
            "session_welcome",
            json!({"session": {"id": "sess-a", "keepalive_timeout_seconds": 10}}),
        );
        match SessionFrame::classify(raw) {
            SessionFrame::Welcome { session } => {
                assert_eq!(session.id, "sess-a");
                assert_eq!(session.keepalive_timeout_seconds, Some(10));
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    #[test]
    fn reconnect_frame_carries_reconnect_url() {
        let raw = frame(
            "session_reconnect",
            json!({"session": {"id": "sess-a", "reconnect_url": "wss://example/ws"}}),
        );
        match SessionFrame::classify(raw) {
            SessionFrame::Reconnect { session } => {
                assert_eq!(session.reconnect_url.as_deref(), Some("wss://example/ws"));
            }
            other => panic!("expected reconnect, got {other:?}"),
        }
    }

    #[test]
    fn notification_frame_preserves_event_verbatim() {
        let event = json!({"broadcaster_user_id": "222", "started_at": "2026-02-17T00:00:00Z"});
        let raw = frame(
            "notification",
            json!({
                "subscription": {
                    "id": "s1",
                    "type": "stream.online",
                    "condition": {"broadcaster_user_id": "222"},
                    "transport": {"method": "websocket", "session_id": "sess-a"}
                },
                "event": event,
            }),
        );
        match SessionFrame::classify(raw) {
            SessionFrame::Notification {
                message_id,
                payload,
            } => {
                assert_eq!(message_id, "m-1");
                assert_eq!(payload.subscription.event_type, "stream.online");
                assert_eq!(
                    payload.subscription.condition.broadcaster_user_id.as_deref(),
                    Some("222")
                );
                assert_eq!(payload.event, event);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn unknown_message_types_do_not_error() {
        let raw = frame("session_party", json!({}));
        assert_eq!(
            SessionFrame::classify(raw),
            SessionFrame::Unknown {
                message_type: "session_party".to_owned()
            }
        );
    }

    #[test]
    fn condition_keeps_undocumented_keys() {
        let condition: SubscriptionCondition = serde_json::from_value(json!({
            "broadcaster_user_id": "222",
            "reward_id": "r-9",
        }))
        .expect("condition should deserialize");
        assert_eq!(condition.broadcaster_user_id.as_deref(), Some("222"));
        assert_eq!(condition.extra.get("reward_id"), Some(&json!("r-9")));
    }

    #[test]
    fn envelope_omits_chat_assets_when_absent() {
        let envelope = EventEnvelope {
            id: "m-1".to_owned(),
            provider: PROVIDER_TWITCH.to_owned(),
            event_type: "stream.online".to_owned(),
            event_timestamp: Utc::now(),
            event: json!({"broadcaster_user_id": "222"}),
            twitch_chat_assets: None,
        };
        let text = serde_json::to_string(&envelope).expect("serialize");
        assert!(!text.contains("twitch_chat_assets"));
        assert!(text.contains("\"type\":\"stream.online\""));
    }
}
