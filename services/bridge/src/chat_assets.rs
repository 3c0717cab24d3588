//! In-memory cache of Twitch chat badges and emotes (global + per channel).
//!
//! Enrichment is best-effort: the delivery path calls `enrich_chat_event`,
//! which never fails and returns `None` when there is nothing to attach.
//! Refreshes are single-flight per (kind, broadcaster); on upstream errors
//! the previous value is kept around for a longer stale-if-error window.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::twitch::{TwitchClient, TwitchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AssetKind {
    GlobalBadges,
    GlobalEmotes,
    ChannelBadges,
    ChannelEmotes,
}

const ALL_KINDS: [AssetKind; 4] = [
    AssetKind::GlobalBadges,
    AssetKind::GlobalEmotes,
    AssetKind::ChannelBadges,
    AssetKind::ChannelEmotes,
];

impl AssetKind {
    fn is_global(self) -> bool {
        matches!(self, AssetKind::GlobalBadges | AssetKind::GlobalEmotes)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheInner {
    global_badges: Option<CacheEntry>,
    global_emotes: Option<CacheEntry>,
    channel_badges: HashMap<String, CacheEntry>,
    channel_emotes: HashMap<String, CacheEntry>,
    inflight: HashSet<(AssetKind, String)>,
}

pub struct ChatAssetCache {
    twitch: Arc<TwitchClient>,
    ttl: Duration,
    stale_if_error: Duration,
    inner: Mutex<CacheInner>,
}

impl ChatAssetCache {
    pub fn new(twitch: Arc<TwitchClient>, ttl: Duration, stale_if_error: Duration) -> Self {
        ChatAssetCache { twitch, ttl, stale_if_error, inner: Mutex::new(CacheInner::default()) }
    }

    fn get(&self, kind: AssetKind, broadcaster_id: &str) -> Option<CacheEntry> {
        let inner = self.inner.lock().expect("chat asset mutex poisoned");
        match kind {
            AssetKind::GlobalBadges => inner.global_badges.clone(),
            AssetKind::GlobalEmotes => inner.global_emotes.clone(),
            AssetKind::ChannelBadges => inner.channel_badges.get(broadcaster_id).cloned(),
            AssetKind::ChannelEmotes => inner.channel_emotes.get(broadcaster_id).cloned(),
        }
    }

    fn set(&self, kind: AssetKind, broadcaster_id: &str, value: Value, ttl: Duration) {
        let expires_at =
            Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero());
        let entry = CacheEntry { value, expires_at };
        let mut inner = self.inner.lock().expect("chat asset mutex poisoned");
        match kind {
            AssetKind::GlobalBadges => inner.global_badges = Some(entry),
            AssetKind::GlobalEmotes => inner.global_emotes = Some(entry),
            AssetKind::ChannelBadges => {
                inner.channel_badges.insert(broadcaster_id.to_owned(), entry);
            }
            AssetKind::ChannelEmotes => {
                inner.channel_emotes.insert(broadcaster_id.to_owned(), entry);
            }
        }
    }

    fn is_fresh(entry: Option<&CacheEntry>) -> bool {
        entry.is_some_and(|e| Utc::now() < e.expires_at)
    }

    async fn fetch(&self, kind: AssetKind, broadcaster_id: &str) -> Result<Value, TwitchError> {
        let token = self.twitch.app_access_token().await?;
        match kind {
            AssetKind::GlobalBadges => self.twitch.get_global_chat_badges(&token).await,
            AssetKind::GlobalEmotes => self.twitch.get_global_emotes(&token).await,
            AssetKind::ChannelBadges => {
                self.twitch.get_channel_chat_badges(&token, broadcaster_id).await
            }
            AssetKind::ChannelEmotes => {
                self.twitch.get_channel_emotes(&token, broadcaster_id).await
            }
        }
    }

    async fn refresh_kind(&self, kind: AssetKind, broadcaster_id: &str) -> Result<(), TwitchError> {
        let value = self.fetch(kind, broadcaster_id).await?;
        self.set(kind, broadcaster_id, value, self.ttl);
        Ok(())
    }

    async fn ensure_fresh(self: Arc<Self>, kind: AssetKind, broadcaster_id: String) {
        let scope = if kind.is_global() { String::new() } else { broadcaster_id.clone() };
        let existing = self.get(kind, &scope);
        if Self::is_fresh(existing.as_ref()) {
            return;
        }
        {
            let mut inner = self.inner.lock().expect("chat asset mutex poisoned");
            if !inner.inflight.insert((kind, scope.clone())) {
                return;
            }
        }
        let result = self.refresh_kind(kind, &scope).await;
        if let Err(err) = result {
            debug!(?kind, broadcaster = %scope, error = %err, "chat asset refresh failed");
            // Keep the old value around longer to avoid hammering Helix.
            if let Some(entry) = existing {
                self.set(kind, &scope, entry.value, self.stale_if_error);
            }
        }
        let mut inner = self.inner.lock().expect("chat asset mutex poisoned");
        inner.inflight.remove(&(kind, scope));
    }

    /// Fire-and-forget refresh of everything a chat event may need.
    pub fn prefetch(self: &Arc<Self>, broadcaster_id: &str) {
        for kind in ALL_KINDS {
            let cache = Arc::clone(self);
            let broadcaster = broadcaster_id.to_owned();
            tokio::spawn(cache.ensure_fresh(kind, broadcaster));
        }
    }

    /// Force-refresh synchronously (explicit API surface).
    pub async fn refresh(&self, broadcaster_id: &str) -> Result<(), TwitchError> {
        self.refresh_kind(AssetKind::GlobalBadges, "").await?;
        self.refresh_kind(AssetKind::GlobalEmotes, "").await?;
        self.refresh_kind(AssetKind::ChannelBadges, broadcaster_id).await?;
        self.refresh_kind(AssetKind::ChannelEmotes, broadcaster_id).await?;
        Ok(())
    }

    /// Whatever is currently cached, holes filled with empty lists.
    pub fn snapshot(&self, broadcaster_id: &str) -> Value {
        let empty = json!({"data": []});
        let value_of = |entry: Option<CacheEntry>| entry.map_or(empty.clone(), |e| e.value);
        json!({
            "badges": {
                "global": value_of(self.get(AssetKind::GlobalBadges, "")),
                "channel": value_of(self.get(AssetKind::ChannelBadges, broadcaster_id)),
            },
            "emotes": {
                "global": value_of(self.get(AssetKind::GlobalEmotes, "")),
                "channel": value_of(self.get(AssetKind::ChannelEmotes, broadcaster_id)),
            },
        })
    }

    /// Resolve the badge and emote references inside a `channel.chat.*` event
    /// into image metadata. Never fails; `None` means "attach nothing".
    pub async fn enrich_chat_event(
        self: &Arc<Self>,
        broadcaster_id: &str,
        event: &Value,
    ) -> Option<Value> {
        // Kick refreshes for next time without blocking this delivery.
        self.prefetch(broadcaster_id);

        let mut badge_lookup = self.badge_lookup(broadcaster_id);
        let emote_lookup = self.emote_lookup(broadcaster_id);

        let needed_badges = needed_badge_keys(event);
        let needed_emotes = needed_emote_ids(event);

        // First-message safety: one synchronous badge refresh when the cache
        // cannot resolve a referenced badge yet.
        if needed_badges.iter().any(|key| !badge_lookup.contains_key(key)) {
            let _ = self.refresh_kind(AssetKind::GlobalBadges, "").await;
            let _ = self.refresh_kind(AssetKind::ChannelBadges, broadcaster_id).await;
            badge_lookup = self.badge_lookup(broadcaster_id);
        }

        let resolved_badges: Vec<Value> =
            needed_badges.iter().filter_map(|key| badge_lookup.get(key).cloned()).collect();
        let resolved_emotes: Vec<Value> =
            needed_emotes.iter().filter_map(|id| emote_lookup.get(id).cloned()).collect();
        let missing_badges: Vec<&String> =
            needed_badges.iter().filter(|key| !badge_lookup.contains_key(*key)).collect();
        let missing_emotes: Vec<&String> =
            needed_emotes.iter().filter(|id| !emote_lookup.contains_key(*id)).collect();

        if resolved_badges.is_empty() && resolved_emotes.is_empty() {
            return None;
        }

        let mut badge_image_map = serde_json::Map::new();
        let mut badge_image_map_by_scale = serde_json::Map::new();
        for badge in &resolved_badges {
            let set_id = badge.get("set_id").and_then(Value::as_str).unwrap_or("");
            let version = badge.get("id").and_then(Value::as_str).unwrap_or("");
            if set_id.is_empty() || version.is_empty() {
                continue;
            }
            let key = format!("{set_id}/{version}");
            let one_x = badge.get("image_url_1x").cloned().unwrap_or(Value::Null);
            let two_x = badge.get("image_url_2x").cloned().unwrap_or(Value::Null);
            let four_x = badge.get("image_url_4x").cloned().unwrap_or(Value::Null);
            let preferred = [&four_x, &two_x, &one_x]
                .into_iter()
                .find(|v| v.as_str().is_some_and(|s| !s.is_empty()))
                .cloned();
            if let Some(url) = preferred {
                badge_image_map.insert(key.clone(), url);
            }
            badge_image_map_by_scale
                .insert(key, json!({"1x": one_x, "2x": two_x, "4x": four_x}));
        }

        Some(json!({
            "badges": resolved_badges,
            "emotes": resolved_emotes,
            "badge_image_map": badge_image_map,
            "badge_image_map_by_scale": badge_image_map_by_scale,
            "missing": {"badges": missing_badges, "emotes": missing_emotes},
        }))
    }

    fn badge_lookup(&self, broadcaster_id: &str) -> HashMap<String, Value> {
        let mut lookup = badge_map(
            self.get(AssetKind::GlobalBadges, "").map(|e| e.value).as_ref(),
        );
        // Channel badges shadow global ones.
        lookup.extend(badge_map(
            self.get(AssetKind::ChannelBadges, broadcaster_id).map(|e| e.value).as_ref(),
        ));
        lookup
    }

    fn emote_lookup(&self, broadcaster_id: &str) -> HashMap<String, Value> {
        let mut lookup = emote_map(
            self.get(AssetKind::GlobalEmotes, "").map(|e| e.value).as_ref(),
        );
        lookup.extend(emote_map(
            self.get(AssetKind::ChannelEmotes, broadcaster_id).map(|e| e.value).as_ref(),
        ));
        lookup
    }
}

/// Badge keys (`set_id/version_id`) referenced by a chat event.
fn needed_badge_keys(event: &Value) -> Vec<String> {
    let mut keys: Vec<String> = event
        .get("badges")
        .and_then(Value::as_array)
        .map(|badges| {
            badges
                .iter()
                .filter_map(|badge| {
                    let set_id = badge.get("set_id")?.as_str()?;
                    let version = badge.get("id")?.as_str()?;
                    if set_id.is_empty() || version.is_empty() {
                        return None;
                    }
                    Some(format!("{set_id}/{version}"))
                })
                .collect()
        })
        .unwrap_or_default();
    keys.sort();
    keys.dedup();
    keys
}

/// Emote ids referenced by a chat event's message fragments.
fn needed_emote_ids(event: &Value) -> Vec<String> {
    let mut ids: Vec<String> = event
        .get("message")
        .and_then(|m| m.get("fragments"))
        .and_then(Value::as_array)
        .map(|fragments| {
            fragments
                .iter()
                .filter(|frag| frag.get("type").and_then(Value::as_str) == Some("emote"))
                .filter_map(|frag| {
                    let id = frag.get("emote")?.get("id")?.as_str()?;
                    if id.is_empty() {
                        None
                    } else {
                        Some(id.to_owned())
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    ids.sort();
    ids.dedup();
    ids
}

/// `set_id/version_id` -> flattened badge version record.
fn badge_map(payload: Option<&Value>) -> HashMap<String, Value> {
    let mut out = HashMap::new();
    let Some(sets) = payload.and_then(|p| p.get("data")).and_then(Value::as_array) else {
        return out;
    };
    for set in sets {
        let set_id = set.get("set_id").and_then(Value::as_str).unwrap_or("");
        let Some(versions) = set.get("versions").and_then(Value::as_array) else { continue };
        for version in versions {
            let version_id = version.get("id").and_then(Value::as_str).unwrap_or("");
            if set_id.is_empty() || version_id.is_empty() {
                continue;
            }
            out.insert(
                format!("{set_id}/{version_id}"),
                json!({
                    "set_id": set_id,
                    "id": version_id,
                    "title": version.get("title").and_then(Value::as_str).unwrap_or(""),
                    "image_url_1x": version.get("image_url_1x").cloned().unwrap_or(Value::Null),
                    "image_url_2x": version.get("image_url_2x").cloned().unwrap_or(Value::Null),
                    "image_url_4x": version.get("image_url_4x").cloned().unwrap_or(Value::Null),
                }),
            );
        }
    }
    out
}

/// emote id -> flattened emote record.
fn emote_map(payload: Option<&Value>) -> HashMap<String, Value> {
    let mut out = HashMap::new();
    let Some(emotes) = payload.and_then(|p| p.get("data")).and_then(Value::as_array) else {
        return out;
    };
    for emote in emotes {
        let id = emote.get("id").and_then(Value::as_str).unwrap_or("");
        if id.is_empty() {
            continue;
        }
        out.insert(
            id.to_owned(),
            json!({
                "id": id,
                "name": emote.get("name").and_then(Value::as_str).unwrap_or(""),
                "images": emote.get("images").cloned().unwrap_or_else(|| json!({})),
                "format": emote.get("format").cloned().unwrap_or(Value::Null),
                "scale": emote.get("scale").cloned().unwrap_or(Value::Null),
                "theme_mode": emote.get("theme_mode").cloned().unwrap_or(Value::Null),
            }),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Arc<ChatAssetCache> {
        let twitch = Arc::new(TwitchClient::new(
            "cid".to_owned(),
            "csecret".to_owned(),
            "https://example.com/cb".to_owned(),
            String::new(),
            "wss://example/ws".to_owned(),
        ));
        Arc::new(ChatAssetCache::new(
            twitch,
            Duration::from_secs(6 * 3600),
            Duration::from_secs(24 * 3600),
        ))
    }

    fn badges_payload() -> Value {
        json!({"data": [
            {"set_id": "subscriber", "versions": [
                {"id": "12", "title": "Subscriber", "image_url_1x": "https://img/1x",
                 "image_url_2x": "https://img/2x", "image_url_4x": "https://img/4x"}
            ]}
        ]})
    }

    fn emotes_payload() -> Value {
        json!({"data": [
            {"id": "e-77", "name": "Kappa", "images": {"url_1x": "https://emote/1x"}}
        ]})
    }

    #[test]
    fn badge_map_keys_are_set_and_version() {
        let map = badge_map(Some(&badges_payload()));
        assert!(map.contains_key("subscriber/12"));
        assert_eq!(map["subscriber/12"]["title"], json!("Subscriber"));
    }

    #[test]
    fn needed_keys_are_deduped_and_sorted() {
        let event = json!({
            "badges": [
                {"set_id": "subscriber", "id": "12"},
                {"set_id": "subscriber", "id": "12"},
                {"set_id": "bits", "id": "100"},
            ],
            "message": {"fragments": [
                {"type": "emote", "emote": {"id": "e-77"}},
                {"type": "text", "text": "hi"},
                {"type": "emote", "emote": {"id": "e-77"}},
            ]},
        });
        assert_eq!(needed_badge_keys(&event), vec!["bits/100", "subscriber/12"]);
        assert_eq!(needed_emote_ids(&event), vec!["e-77"]);
    }

    #[tokio::test]
    async fn enrichment_resolves_from_cache() {
        let cache = cache();
        cache.set(AssetKind::GlobalBadges, "", badges_payload(), Duration::from_secs(3600));
        cache.set(AssetKind::ChannelEmotes, "222", emotes_payload(), Duration::from_secs(3600));

        let event = json!({
            "badges": [{"set_id": "subscriber", "id": "12"}],
            "message": {"fragments": [{"type": "emote", "emote": {"id": "e-77"}}]},
        });
        let enriched =
            cache.enrich_chat_event("222", &event).await.expect("enrichment should resolve");
        assert_eq!(enriched["badges"][0]["set_id"], json!("subscriber"));
        assert_eq!(enriched["emotes"][0]["id"], json!("e-77"));
        assert_eq!(enriched["badge_image_map"]["subscriber/12"], json!("https://img/4x"));
        assert_eq!(
            enriched["badge_image_map_by_scale"]["subscriber/12"]["1x"],
            json!("https://img/1x")
        );
        assert!(enriched["missing"]["badges"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enrichment_without_references_attaches_nothing() {
        let cache = cache();
        cache.set(AssetKind::GlobalBadges, "", badges_payload(), Duration::from_secs(3600));
        let event = json!({"message": {"text": "plain"}});
        assert!(cache.enrich_chat_event("222", &event).await.is_none());
    }

    #[test]
    fn snapshot_fills_holes_with_empty_lists() {
        let cache = cache();
        cache.set(AssetKind::GlobalBadges, "", badges_payload(), Duration::from_secs(3600));
        let snapshot = cache.snapshot("222");
        assert_eq!(snapshot["badges"]["global"]["data"][0]["set_id"], json!("subscriber"));
        assert_eq!(snapshot["badges"]["channel"], json!({"data": []}));
        assert_eq!(snapshot["emotes"]["global"], json!({"data": []}));
    }
}
