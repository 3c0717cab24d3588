use std::sync::Arc;

use sqlx::PgPool;

use crate::chat_assets::ChatAssetCache;
use crate::config::Settings;
use crate::eventsub::EventSubManager;
use crate::hub::EventHub;
use crate::net::{self, IpNetwork};
use crate::registry::InterestRegistry;
use crate::stores::{MessageDeduper, WsTokenStore};
use crate::twitch::TwitchClient;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub settings: Arc<Settings>,
    pub registry: Arc<InterestRegistry>,
    pub hub: Arc<EventHub>,
    pub deduper: Arc<MessageDeduper>,
    pub ws_tokens: Arc<WsTokenStore>,
    pub twitch: Arc<TwitchClient>,
    pub chat_assets: Arc<ChatAssetCache>,
    pub manager: Arc<EventSubManager>,
    /// Parsed once at startup from `APP_ALLOWED_IPS`.
    pub allowed_networks: Arc<Vec<IpNetwork>>,
    /// Parsed once at startup from `APP_WEBHOOK_TARGET_ALLOWLIST`.
    pub webhook_allowlist: Arc<Vec<String>>,
}

impl AppState {
    /// Wire the whole object graph. Fails on malformed allow-list settings.
    pub fn build(pool: PgPool, settings: Arc<Settings>) -> Result<AppState, String> {
        let twitch = Arc::new(TwitchClient::new(
            settings.twitch_client_id.clone(),
            settings.twitch_client_secret.clone(),
            settings.twitch_redirect_uri.clone(),
            settings.twitch_scopes.clone(),
            settings.twitch_eventsub_ws_url.clone(),
        ));
        AppState::build_with_twitch(pool, settings, twitch)
    }

    /// Same wiring with a caller-supplied upstream client; the integration
    /// suite passes one aimed at a local Twitch stand-in.
    pub fn build_with_twitch(
        pool: PgPool,
        settings: Arc<Settings>,
        twitch: Arc<TwitchClient>,
    ) -> Result<AppState, String> {
        let allowed_networks = net::parse_allowed_ip_networks(&settings.app_allowed_ips)?;
        let webhook_allowlist =
            net::parse_webhook_target_allowlist(&settings.app_webhook_target_allowlist)?;
        let registry = Arc::new(InterestRegistry::new());
        let hub = Arc::new(EventHub::new(pool.clone()));
        let deduper = Arc::new(MessageDeduper::new(settings.tunables.dedupe_ttl));
        let ws_tokens = Arc::new(WsTokenStore::new(settings.tunables.ws_token_ttl));
        let chat_assets = Arc::new(ChatAssetCache::new(
            Arc::clone(&twitch),
            settings.tunables.chat_assets_ttl,
            settings.tunables.chat_assets_stale_if_error,
        ));
        let manager = Arc::new(EventSubManager::new(
            pool.clone(),
            Arc::clone(&settings),
            Arc::clone(&twitch),
            Arc::clone(&registry),
            Arc::clone(&hub),
            Arc::clone(&chat_assets),
            Arc::clone(&deduper),
        ));
        Ok(AppState {
            pool,
            settings,
            registry,
            hub,
            deduper,
            ws_tokens,
            twitch,
            chat_assets,
            manager,
            allowed_networks: Arc::new(allowed_networks),
            webhook_allowlist: Arc::new(webhook_allowlist),
        })
    }
}
