//! The interest–subscription reconciliation and fan-out engine.
//!
//! One `EventSubManager` per process. The submodules split the engine along
//! its task boundaries: the upstream-WS session machine, the reconciler, the
//! per-key subscription ensurer, the notification pipeline, and the
//! stale-interest GC. Everything shares this struct; the `sub_lock` mutex is
//! a serialization lock that intentionally spans upstream I/O.

pub mod ensure;
pub mod gc;
pub mod notify;
pub mod reconcile;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::{self, Transport};
use crate::chat_assets::ChatAssetCache;
use crate::config::Settings;
use crate::hub::EventHub;
use crate::redact;
use crate::registry::{InterestKey, InterestRegistry};
use crate::repo;
use crate::stores::MessageDeduper;
use crate::twitch::TwitchClient;

const TRACE_PAYLOAD_MAX_CHARS: usize = 12_000;
const AUDIT_PAYLOAD_MAX_CHARS: usize = 8_000;

/// Key of the per-consumer `subscription.error` throttle.
type ErrorThrottleKey = (Uuid, Uuid, String, String, String);

/// One row of the active upstream-subscription snapshot served to consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSubscription {
    pub twitch_subscription_id: String,
    pub status: String,
    pub event_type: String,
    pub broadcaster_user_id: String,
    pub upstream_transport: String,
    pub session_id: Option<String>,
    pub connected_at: Option<String>,
    pub disconnected_at: Option<String>,
    pub bot_id: Uuid,
}

#[derive(Default)]
struct SnapshotCache {
    cached_at: Option<DateTime<Utc>>,
    rows: Vec<ActiveSubscription>,
}

#[derive(Default)]
struct NameCaches {
    consumers: HashMap<Uuid, (String, DateTime<Utc>)>,
    bots: HashMap<Uuid, (String, DateTime<Utc>)>,
    broadcasters: HashMap<String, (String, DateTime<Utc>)>,
}

pub struct EventSubManager {
    pub(crate) pool: PgPool,
    pub(crate) settings: Arc<Settings>,
    pub(crate) twitch: Arc<TwitchClient>,
    pub(crate) registry: Arc<InterestRegistry>,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) chat_assets: Arc<ChatAssetCache>,
    pub(crate) deduper: Arc<MessageDeduper>,
    session_id: StdMutex<Option<String>>,
    zero_listener_since: StdMutex<Option<DateTime<Utc>>>,
    /// Serialization lock: reconcile and per-key ensure never overlap.
    pub(crate) sub_lock: Mutex<()>,
    error_throttle: StdMutex<HashMap<ErrorThrottleKey, DateTime<Utc>>>,
    pub(crate) fanout: Arc<Semaphore>,
    snapshot_cache: Mutex<SnapshotCache>,
    name_caches: StdMutex<NameCaches>,
    stop: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl EventSubManager {
    pub fn new(
        pool: PgPool,
        settings: Arc<Settings>,
        twitch: Arc<TwitchClient>,
        registry: Arc<InterestRegistry>,
        hub: Arc<EventHub>,
        chat_assets: Arc<ChatAssetCache>,
        deduper: Arc<MessageDeduper>,
    ) -> Self {
        let fanout = Arc::new(Semaphore::new(settings.tunables.fanout_concurrency));
        EventSubManager {
            pool,
            settings,
            twitch,
            registry,
            hub,
            chat_assets,
            deduper,
            session_id: StdMutex::new(None),
            zero_listener_since: StdMutex::new(None),
            sub_lock: Mutex::new(()),
            error_throttle: StdMutex::new(HashMap::new()),
            fanout,
            snapshot_cache: Mutex::new(SnapshotCache::default()),
            name_caches: StdMutex::new(NameCaches::default()),
            stop: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Load interests, reconcile against upstream, ensure what can be ensured
    /// without a websocket session, then launch the long-lived tasks.
    pub async fn start(self: &Arc<Self>) {
        self.load_interests().await;
        if let Err(err) = self.sync_from_twitch_and_reconcile().await {
            warn!(error = %err, "initial reconcile failed");
        }
        self.ensure_authorization_revoke_subscription().await;
        self.ensure_webhook_subscriptions().await;
        self.refresh_stream_states_for_active_subscriptions().await;
        self.refresh_stream_states_for_interested_channels().await;

        let session = Arc::clone(self);
        let gc = Arc::clone(self);
        let mut tasks = self.tasks.lock().expect("task list mutex poisoned");
        tasks.push(tokio::spawn(async move { session.run_session_loop().await }));
        tasks.push(tokio::spawn(async move { gc.run_gc_loop().await }));
    }

    /// Set the stop flag, cancel the tasks, and wait for them to wind down.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().expect("task list mutex poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn load_interests(&self) {
        match repo::interests::list_all(&self.pool).await {
            Ok(interests) => self.registry.load(interests),
            Err(err) => warn!(error = %err, "failed loading interests from store"),
        }
    }

    // -----------------------------------------------------------------------
    // Session id
    // -----------------------------------------------------------------------

    pub(crate) fn current_session(&self) -> Option<String> {
        self.session_id.lock().expect("session mutex poisoned").clone()
    }

    pub(crate) fn set_session(&self, session_id: Option<String>) {
        *self.session_id.lock().expect("session mutex poisoned") = session_id;
    }

    /// Clear the session only when it still equals `snapshot` — a newer
    /// welcome must not be clobbered by a stale failure.
    pub(crate) fn clear_session_if(&self, snapshot: &str) {
        let mut current = self.session_id.lock().expect("session mutex poisoned");
        if current.as_deref() == Some(snapshot) {
            *current = None;
        }
    }

    /// Forget the zero-listener baseline; the next cooldown check restarts
    /// the clock.
    pub(crate) fn reset_cooldown_clock(&self) {
        *self.zero_listener_since.lock().expect("cooldown mutex poisoned") = None;
    }

    // -----------------------------------------------------------------------
    // Transport / interest predicates
    // -----------------------------------------------------------------------

    pub(crate) fn transport_for_event(&self, event_type: &str) -> Transport {
        catalog::best_transport(event_type, self.settings.webhook_available()).0
    }

    pub(crate) fn has_websocket_interest(&self) -> bool {
        self.registry
            .keys()
            .iter()
            .any(|key| self.transport_for_event(&key.event_type) == Transport::Websocket)
    }

    pub(crate) fn has_stream_state_interest(&self) -> bool {
        self.registry
            .keys()
            .iter()
            .any(|key| matches!(key.event_type.as_str(), "stream.online" | "stream.offline"))
    }

    /// Time left before the idle upstream-WS should be suspended. `None`
    /// means the cooldown does not apply right now.
    pub(crate) async fn ws_cooldown_remaining(&self) -> Option<ChronoDuration> {
        // Stream-state subscriptions stay live even with no consumers online.
        if self.has_stream_state_interest() {
            *self.zero_listener_since.lock().expect("cooldown mutex poisoned") = None;
            return None;
        }
        let (active, latest_disconnect) = match repo::stats::ws_activity(&self.pool).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "failed reading consumer ws activity");
                return None;
            }
        };
        if active > 0 {
            *self.zero_listener_since.lock().expect("cooldown mutex poisoned") = None;
            return None;
        }
        let now = Utc::now();
        let cooldown = ChronoDuration::from_std(self.settings.tunables.ws_listener_cooldown)
            .unwrap_or_else(|_| ChronoDuration::zero());
        let mut since = self.zero_listener_since.lock().expect("cooldown mutex poisoned");
        if let Some(disconnect) = latest_disconnect {
            // Clamp future-dated rows (clock skew) to now.
            let disconnect = disconnect.min(now);
            if since.map_or(true, |current| disconnect > current) {
                *since = Some(disconnect);
            }
        }
        let baseline = *since.get_or_insert(now);
        Some(cooldown - (now - baseline))
    }

    // -----------------------------------------------------------------------
    // Subscription-error throttle
    // -----------------------------------------------------------------------

    /// At most one `subscription.error` per (consumer, key, code) per
    /// cooldown window.
    pub(crate) fn should_emit_subscription_error(
        &self,
        consumer_id: Uuid,
        key: &InterestKey,
        error_code: &str,
    ) -> bool {
        let now = Utc::now();
        let cooldown = ChronoDuration::from_std(self.settings.tunables.subscription_error_cooldown)
            .unwrap_or_else(|_| ChronoDuration::zero());
        let throttle_key = (
            consumer_id,
            key.bot_id,
            key.event_type.clone(),
            key.broadcaster_user_id.clone(),
            error_code.to_owned(),
        );
        let mut throttle = self.error_throttle.lock().expect("throttle mutex poisoned");
        throttle.retain(|_, sent_at| now - *sent_at < cooldown);
        if throttle.get(&throttle_key).is_some_and(|sent_at| now - *sent_at < cooldown) {
            return false;
        }
        throttle.insert(throttle_key, now);
        true
    }

    // -----------------------------------------------------------------------
    // Audit log and traces
    // -----------------------------------------------------------------------

    /// Emit a structured audit record on the `audit` tracing target. High
    /// volume fan-out kinds skip the name enrichment lookups.
    pub(crate) async fn audit(&self, level: &str, payload: Value) {
        let kind = payload.get("kind").and_then(Value::as_str).unwrap_or("").to_owned();
        let payload = if matches!(kind.as_str(), "eventsub_incoming" | "eventsub_outgoing") {
            payload
        } else {
            self.enrich_audit_payload(payload).await
        };
        let mut record = redact::redact_json(&payload);
        if let Some(map) = record.as_object_mut() {
            map.entry("timestamp").or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
            map.entry("level").or_insert_with(|| Value::String(level.to_owned()));
        }
        let text = redact::truncate_payload(record.to_string(), AUDIT_PAYLOAD_MAX_CHARS);
        match level {
            "error" => tracing::error!(target: "audit", "{text}"),
            "warning" => tracing::warn!(target: "audit", "{text}"),
            _ => tracing::info!(target: "audit", "{text}"),
        }
    }

    async fn enrich_audit_payload(&self, payload: Value) -> Value {
        let Value::Object(mut map) = payload else { return payload };
        if let Some(consumer_id) = uuid_field(&map, "consumer_id") {
            if let Some(name) = self.resolve_consumer_name(consumer_id).await {
                map.entry("consumer_name").or_insert(Value::String(name));
            }
        }
        if let Some(bot_id) = uuid_field(&map, "bot_id") {
            if let Some(name) = self.resolve_bot_name(bot_id).await {
                map.entry("bot_name").or_insert(Value::String(name));
            }
        }
        if let Some(broadcaster) = map.get("broadcaster_user_id").and_then(Value::as_str) {
            let broadcaster = broadcaster.to_owned();
            if let Some(name) = self.resolve_broadcaster_name(&broadcaster).await {
                map.entry("broadcaster_name").or_insert(Value::String(name));
            }
        }
        Value::Object(map)
    }

    fn cached_name<K: std::hash::Hash + Eq>(
        &self,
        cache: &HashMap<K, (String, DateTime<Utc>)>,
        key: &K,
    ) -> Option<String> {
        let ttl = ChronoDuration::from_std(self.settings.tunables.name_cache_ttl)
            .unwrap_or_else(|_| ChronoDuration::zero());
        cache
            .get(key)
            .filter(|(_, cached_at)| Utc::now() - *cached_at <= ttl)
            .map(|(name, _)| name.clone())
    }

    async fn resolve_consumer_name(&self, consumer_id: Uuid) -> Option<String> {
        {
            let caches = self.name_caches.lock().expect("name cache mutex poisoned");
            if let Some(name) = self.cached_name(&caches.consumers, &consumer_id) {
                return Some(name);
            }
        }
        let name = repo::consumers::get(&self.pool, consumer_id).await.ok()??.name;
        let mut caches = self.name_caches.lock().expect("name cache mutex poisoned");
        caches.consumers.insert(consumer_id, (name.clone(), Utc::now()));
        Some(name)
    }

    async fn resolve_bot_name(&self, bot_id: Uuid) -> Option<String> {
        {
            let caches = self.name_caches.lock().expect("name cache mutex poisoned");
            if let Some(name) = self.cached_name(&caches.bots, &bot_id) {
                return Some(name);
            }
        }
        let name = repo::bots::get(&self.pool, bot_id).await.ok()??.name;
        let mut caches = self.name_caches.lock().expect("name cache mutex poisoned");
        caches.bots.insert(bot_id, (name.clone(), Utc::now()));
        Some(name)
    }

    async fn resolve_broadcaster_name(&self, broadcaster_user_id: &str) -> Option<String> {
        if broadcaster_user_id.is_empty() {
            return None;
        }
        {
            let caches = self.name_caches.lock().expect("name cache mutex poisoned");
            if let Some(name) =
                self.cached_name(&caches.broadcasters, &broadcaster_user_id.to_owned())
            {
                return Some(name);
            }
        }
        let user = self.twitch.get_user_by_id_app(broadcaster_user_id).await.ok()??;
        let display = user.get("display_name").and_then(Value::as_str).unwrap_or("");
        let login = user.get("login").and_then(Value::as_str).unwrap_or("");
        let name = if display.is_empty() { login } else { display };
        if name.is_empty() {
            return None;
        }
        let mut caches = self.name_caches.lock().expect("name cache mutex poisoned");
        caches.broadcasters.insert(broadcaster_user_id.to_owned(), (name.to_owned(), Utc::now()));
        Some(name.to_owned())
    }

    /// Best-effort event trace; failures only reach the debug log.
    pub(crate) async fn record_trace(
        &self,
        consumer_id: Uuid,
        direction: &str,
        local_transport: &str,
        event_type: &str,
        target: Option<&str>,
        payload: &Value,
    ) {
        let redacted = redact::redact_json(payload);
        let payload_json = redact::truncate_payload(redacted.to_string(), TRACE_PAYLOAD_MAX_CHARS);
        let target = target.map(redact::redact_target);
        if let Err(err) = repo::traces::record(
            &self.pool,
            consumer_id,
            direction,
            local_transport,
            event_type,
            target.as_deref(),
            &payload_json,
        )
        .await
        {
            debug!(%consumer_id, error = %err, "skipping event trace write");
        }
    }

    // -----------------------------------------------------------------------
    // Active upstream subscription snapshot
    // -----------------------------------------------------------------------

    /// Merged upstream listing mapped to owning bots, cached briefly.
    /// Returns (rows, cached_at, served_from_cache).
    pub async fn active_subscriptions_snapshot(
        &self,
        force_refresh: bool,
    ) -> (Vec<ActiveSubscription>, DateTime<Utc>, bool) {
        let ttl = ChronoDuration::from_std(self.settings.tunables.active_subs_cache_ttl)
            .unwrap_or_else(|_| ChronoDuration::zero());
        let now = Utc::now();
        let mut cache = self.snapshot_cache.lock().await;
        if !force_refresh {
            if let Some(cached_at) = cache.cached_at {
                if now - cached_at < ttl {
                    return (cache.rows.clone(), cached_at, true);
                }
            }
        }
        let remote = self.list_subscriptions_all_tokens().await;
        let prior_owners: HashMap<String, Uuid> = repo::subscriptions::prior_owners(&self.pool)
            .await
            .map(|rows| rows.into_iter().collect())
            .unwrap_or_default();
        let mut rows = Vec::new();
        for sub in &remote {
            let Some(parsed) = reconcile::parse_remote_subscription(sub) else { continue };
            let Some(bot_id) = self.resolve_remote_owner(&parsed, &prior_owners).await else {
                continue;
            };
            rows.push(ActiveSubscription {
                twitch_subscription_id: parsed.id,
                status: parsed.status,
                event_type: parsed.event_type,
                broadcaster_user_id: parsed.broadcaster_user_id,
                upstream_transport: parsed.method.as_str().to_owned(),
                session_id: parsed.session_id,
                connected_at: parsed.connected_at,
                disconnected_at: parsed.disconnected_at,
                bot_id,
            });
        }
        cache.rows = rows.clone();
        cache.cached_at = Some(now);
        (rows, now, false)
    }

    /// Union of subscriptions visible through the app token and every enabled
    /// bot's user token, merged by upstream id.
    pub(crate) async fn list_subscriptions_all_tokens(&self) -> Vec<Value> {
        let mut merged: HashMap<String, Value> = HashMap::new();
        match self.twitch.list_eventsub_subscriptions(None).await {
            Ok(subs) => {
                for sub in subs {
                    if let Some(id) = sub.get("id").and_then(Value::as_str) {
                        if !id.is_empty() {
                            merged.insert(id.to_owned(), sub);
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "app-token subscription listing failed"),
        }
        let bots = match repo::bots::list_enabled(&self.pool).await {
            Ok(bots) => bots,
            Err(err) => {
                warn!(error = %err, "failed listing enabled bots");
                Vec::new()
            }
        };
        for bot in bots {
            let token =
                match crate::bot_tokens::ensure_bot_access_token(&self.pool, &self.twitch, &bot)
                    .await
                {
                    Ok(token) => token,
                    Err(err) => {
                        debug!(bot = %bot.name, error = %err, "skipping bot token listing");
                        continue;
                    }
                };
            match self.twitch.list_eventsub_subscriptions(Some(&token)).await {
                Ok(subs) => {
                    for sub in subs {
                        if let Some(id) = sub.get("id").and_then(Value::as_str) {
                            if !id.is_empty() {
                                merged.insert(id.to_owned(), sub);
                            }
                        }
                    }
                }
                Err(err) => debug!(bot = %bot.name, error = %err, "bot-token listing failed"),
            }
        }
        merged.into_values().collect()
    }

    /// Map a remote subscription to the bot that owns it: chat conditions
    /// carry the bot's user id, otherwise fall back to the previous local
    /// owner and finally to a bot whose identity is the broadcaster itself.
    pub(crate) async fn resolve_remote_owner(
        &self,
        parsed: &reconcile::RemoteSubscription,
        prior_owners: &HashMap<String, Uuid>,
    ) -> Option<Uuid> {
        if parsed.event_type.starts_with("channel.chat.") {
            let bot_user_id = parsed.condition_user_id.as_deref()?;
            return repo::bots::get_by_twitch_user_id(&self.pool, bot_user_id)
                .await
                .ok()
                .flatten()
                .map(|bot| bot.id);
        }
        if let Some(previous) = prior_owners.get(&parsed.id) {
            if let Ok(Some(bot)) = repo::bots::get(&self.pool, *previous).await {
                return Some(bot.id);
            }
        }
        repo::bots::get_by_twitch_user_id(&self.pool, &parsed.broadcaster_user_id)
            .await
            .ok()
            .flatten()
            .map(|bot| bot.id)
    }
}

fn uuid_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<Uuid> {
    map.get(key).and_then(Value::as_str).and_then(|raw| Uuid::parse_str(raw).ok())
}
