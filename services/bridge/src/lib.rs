pub mod auth;
pub mod bot_tokens;
pub mod catalog;
pub mod chat_assets;
pub mod config;
pub mod db;
pub mod eventsub;
pub mod http;
pub mod hub;
pub mod net;
pub mod normalize;
pub mod redact;
pub mod registry;
pub mod repo;
pub mod state;
pub mod stores;
pub mod twitch;
pub mod ws_events;

pub use state::AppState;

use axum::{
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/events", get(ws_events::ws_events_handler))
        .route("/webhooks/twitch/eventsub", post(http::webhook::twitch_eventsub_webhook))
        .route("/v1/bots", get(http::bots::list_bots))
        .route("/v1/bots/accessible", get(http::bots::list_accessible_bots))
        .route(
            "/v1/admin/consumers",
            get(http::admin::list_consumers).post(http::admin::create_consumer),
        )
        .route(
            "/v1/admin/consumers/:client_id/regenerate",
            post(http::admin::regenerate_consumer_secret),
        )
        .route(
            "/v1/interests",
            get(http::interests::list_interests).post(http::interests::create_interest),
        )
        .route("/v1/interests/heartbeat", post(http::interests::heartbeat_all_interests))
        .route("/v1/interests/:interest_id", delete(http::interests::delete_interest))
        .route(
            "/v1/interests/:interest_id/heartbeat",
            post(http::interests::heartbeat_interest),
        )
        .route("/v1/subscriptions", get(http::subscriptions::list_consumer_subscriptions))
        .route(
            "/v1/subscriptions/transports",
            get(http::subscriptions::list_subscription_transports),
        )
        .route(
            "/v1/eventsub/subscriptions/active",
            get(http::subscriptions::list_active_upstream_subscriptions),
        )
        .route(
            "/v1/eventsub/subscription-types",
            get(http::catalog::list_subscription_types),
        )
        .route("/v1/ws-token", post(http::ws_token::create_ws_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}
