//! Idempotent reconciliation of the local subscription table against the
//! merged upstream listing.
//!
//! Runs at startup, on every welcome, and on administrative rebuild. The
//! local table is truncated and rebuilt from upstream truth; dead
//! websocket-bound subscriptions and duplicates are deleted at Twitch.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::EventSubManager;
use crate::bot_tokens::ensure_bot_access_token;
use crate::catalog::Transport;
use crate::repo;

/// An upstream subscription row in the fields the bridge cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscription {
    pub id: String,
    pub event_type: String,
    pub status: String,
    pub broadcaster_user_id: String,
    pub condition_user_id: Option<String>,
    pub method: Transport,
    pub session_id: Option<String>,
    pub connected_at: Option<String>,
    pub disconnected_at: Option<String>,
}

/// Extract the routable fields; rows without an id, type, broadcaster, or a
/// known transport method are not reconcilable and are skipped.
pub fn parse_remote_subscription(sub: &Value) -> Option<RemoteSubscription> {
    let id = sub.get("id").and_then(Value::as_str).unwrap_or("").trim().to_owned();
    let event_type = sub.get("type").and_then(Value::as_str).unwrap_or("").trim().to_owned();
    let status =
        sub.get("status").and_then(Value::as_str).unwrap_or("unknown").trim().to_owned();
    let condition = sub.get("condition").cloned().unwrap_or(Value::Null);
    let broadcaster_user_id = condition
        .get("broadcaster_user_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_owned();
    let condition_user_id = condition
        .get("user_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);
    let transport = sub.get("transport").cloned().unwrap_or(Value::Null);
    let method = Transport::parse(transport.get("method").and_then(Value::as_str).unwrap_or(""))?;
    if id.is_empty() || event_type.is_empty() || broadcaster_user_id.is_empty() {
        return None;
    }
    let string_field = |name: &str| {
        transport
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };
    Some(RemoteSubscription {
        id,
        event_type,
        status,
        broadcaster_user_id,
        condition_user_id,
        method,
        session_id: string_field("session_id"),
        connected_at: string_field("connected_at"),
        disconnected_at: string_field("disconnected_at"),
    })
}

/// A websocket subscription whose status is anything but `enabled*` is bound
/// to a dead session and cannot recover.
pub fn is_dead_websocket_status(status: &str) -> bool {
    let normalized = status.trim().to_ascii_lowercase();
    !normalized.is_empty() && !normalized.starts_with("enabled")
}

/// Ranking for duplicate resolution: prefer enabled, then the latest
/// `connected_at`, then the largest upstream id. Timestamps are parsed as
/// RFC 3339 and compared as instants; unparsable values rank below any
/// parsed one and fall back to lexicographic order among themselves.
pub fn duplicate_rank(sub: &RemoteSubscription) -> (bool, Option<DateTime<Utc>>, String, String) {
    let parsed = sub
        .connected_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));
    (
        sub.status.starts_with("enabled"),
        parsed,
        sub.connected_at.clone().unwrap_or_default(),
        sub.id.clone(),
    )
}

impl EventSubManager {
    /// Rebuild the local subscription table from upstream truth.
    pub async fn sync_from_twitch_and_reconcile(&self) -> Result<(), sqlx::Error> {
        let _serialized = self.sub_lock.lock().await;
        let remote = self.list_subscriptions_all_tokens().await;
        let prior_owners: HashMap<String, Uuid> =
            repo::subscriptions::prior_owners(&self.pool).await?.into_iter().collect();
        repo::subscriptions::delete_all(&self.pool).await?;

        let mut deduped: HashMap<(Uuid, String, String), (RemoteSubscription, Uuid)> =
            HashMap::new();
        let mut duplicates: Vec<(RemoteSubscription, Uuid)> = Vec::new();

        for sub in &remote {
            let Some(parsed) = parse_remote_subscription(sub) else { continue };
            // Keep only rows on the transport the catalog would pick today;
            // the rest belong to an older configuration and die naturally.
            if parsed.method != self.transport_for_event(&parsed.event_type) {
                continue;
            }
            let Some(bot_id) = self.resolve_remote_owner(&parsed, &prior_owners).await else {
                continue;
            };
            if parsed.method == Transport::Websocket && is_dead_websocket_status(&parsed.status) {
                self.delete_remote_subscription(&parsed, bot_id).await;
                info!(
                    subscription_id = %parsed.id,
                    event_type = %parsed.event_type,
                    status = %parsed.status,
                    "removed stale websocket subscription for automatic recovery"
                );
                continue;
            }
            let dedupe_key =
                (bot_id, parsed.event_type.clone(), parsed.broadcaster_user_id.clone());
            match deduped.entry(dedupe_key) {
                Entry::Vacant(slot) => {
                    slot.insert((parsed, bot_id));
                }
                Entry::Occupied(mut slot) => {
                    if duplicate_rank(&parsed) > duplicate_rank(&slot.get().0) {
                        let loser = slot.insert((parsed, bot_id));
                        duplicates.push(loser);
                    } else {
                        duplicates.push((parsed, bot_id));
                    }
                }
            }
        }

        for (kept, bot_id) in deduped.values() {
            repo::subscriptions::insert(
                &self.pool,
                *bot_id,
                &kept.event_type,
                &kept.broadcaster_user_id,
                &kept.id,
                &kept.status,
                kept.session_id.as_deref(),
            )
            .await?;
        }

        for (duplicate, bot_id) in duplicates {
            self.delete_remote_subscription(&duplicate, bot_id).await;
            warn!(
                subscription_id = %duplicate.id,
                event_type = %duplicate.event_type,
                broadcaster = %duplicate.broadcaster_user_id,
                "removed duplicate upstream subscription during reconcile"
            );
        }
        Ok(())
    }

    /// Best-effort upstream delete; websocket-bound rows use the owning
    /// bot's user token when one can be produced.
    async fn delete_remote_subscription(&self, sub: &RemoteSubscription, bot_id: Uuid) {
        let mut delete_token: Option<String> = None;
        if sub.method == Transport::Websocket {
            if let Ok(Some(bot)) = repo::bots::get(&self.pool, bot_id).await {
                if bot.enabled {
                    delete_token =
                        ensure_bot_access_token(&self.pool, &self.twitch, &bot).await.ok();
                }
            }
        }
        if let Err(err) =
            self.twitch.delete_eventsub_subscription(&sub.id, delete_token.as_deref()).await
        {
            if !err.is_subscription_not_found() {
                warn!(subscription_id = %sub.id, error = %err,
                    "failed deleting upstream subscription during reconcile");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote(id: &str, status: &str, connected_at: Option<&str>) -> RemoteSubscription {
        RemoteSubscription {
            id: id.to_owned(),
            event_type: "stream.online".to_owned(),
            status: status.to_owned(),
            broadcaster_user_id: "222".to_owned(),
            condition_user_id: None,
            method: Transport::Websocket,
            session_id: Some("sess-a".to_owned()),
            connected_at: connected_at.map(str::to_owned),
            disconnected_at: None,
        }
    }

    #[test]
    fn parse_extracts_routable_fields() {
        let parsed = parse_remote_subscription(&json!({
            "id": "s1",
            "type": "channel.chat.message",
            "status": "enabled",
            "condition": {"broadcaster_user_id": "222", "user_id": "111"},
            "transport": {"method": "websocket", "session_id": "sess-a",
                          "connected_at": "2026-02-17T00:00:00Z"},
        }))
        .expect("should parse");
        assert_eq!(parsed.id, "s1");
        assert_eq!(parsed.method, Transport::Websocket);
        assert_eq!(parsed.condition_user_id.as_deref(), Some("111"));
        assert_eq!(parsed.session_id.as_deref(), Some("sess-a"));
    }

    #[test]
    fn parse_rejects_unroutable_rows() {
        // conduit transport
        assert!(parse_remote_subscription(&json!({
            "id": "s1", "type": "stream.online",
            "condition": {"broadcaster_user_id": "222"},
            "transport": {"method": "conduit"},
        }))
        .is_none());
        // no broadcaster in the condition
        assert!(parse_remote_subscription(&json!({
            "id": "s1", "type": "user.update",
            "condition": {"user_id": "111"},
            "transport": {"method": "webhook"},
        }))
        .is_none());
        // no id
        assert!(parse_remote_subscription(&json!({
            "type": "stream.online",
            "condition": {"broadcaster_user_id": "222"},
            "transport": {"method": "webhook"},
        }))
        .is_none());
    }

    #[test]
    fn enabled_wins_regardless_of_timestamps() {
        let enabled = remote("s-enabled", "enabled", Some("2026-02-01T00:00:00Z"));
        let failed = remote("s-failed", "websocket_failed_ping", Some("2026-02-20T00:00:00Z"));
        assert!(duplicate_rank(&enabled) > duplicate_rank(&failed));
    }

    #[test]
    fn later_connection_wins_among_enabled() {
        let older = remote("s-old", "enabled", Some("2026-02-17T00:00:00Z"));
        let newer = remote("s-new", "enabled", Some("2026-02-18T00:00:00Z"));
        assert!(duplicate_rank(&newer) > duplicate_rank(&older));
    }

    #[test]
    fn offset_timestamps_compare_as_instants() {
        // Same instant spelled two ways, so the id breaks the tie.
        let utc = remote("s-b", "enabled", Some("2026-02-17T12:00:00Z"));
        let offset = remote("s-a", "enabled", Some("2026-02-17T14:00:00+02:00"));
        assert!(duplicate_rank(&utc) > duplicate_rank(&offset));
    }

    #[test]
    fn unparsable_timestamps_rank_below_parsed_ones() {
        let parsed = remote("s-a", "enabled", Some("2026-02-17T00:00:00Z"));
        let garbage = remote("s-z", "enabled", Some("yesterday"));
        let missing = remote("s-z", "enabled", None);
        assert!(duplicate_rank(&parsed) > duplicate_rank(&garbage));
        assert!(duplicate_rank(&parsed) > duplicate_rank(&missing));
        // among unparsable values, lexicographic raw order applies
        assert!(duplicate_rank(&garbage) > duplicate_rank(&missing));
    }

    #[test]
    fn dead_websocket_status_detection() {
        assert!(is_dead_websocket_status("websocket_disconnected"));
        assert!(is_dead_websocket_status("websocket_failed_ping_pong"));
        assert!(!is_dead_websocket_status("enabled"));
        assert!(!is_dead_websocket_status(""));
    }
}
