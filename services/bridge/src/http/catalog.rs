//! The static subscription-type catalog, annotated with the transport the
//! bridge would pick under the current configuration.

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde_json::json;

use super::require_consumer;
use crate::catalog::{self, Transport};
use crate::state::AppState;

pub async fn list_subscription_types(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(response) = require_consumer(&state, &headers).await {
        return response;
    }
    let webhook_available = state.settings.webhook_available();
    let mut webhook_preferred = Vec::new();
    let mut websocket_preferred = Vec::new();
    let mut all_items = Vec::new();
    for entry in catalog::CATALOG {
        let (best, reason) = catalog::best_transport(entry.event_type, webhook_available);
        let item = json!({
            "title": entry.title,
            "event_type": entry.event_type,
            "version": entry.version,
            "description": entry.description,
            "status": entry.status,
            "twitch_transports": catalog::supported_upstream_transports(entry.event_type),
            "best_transport": best,
            "best_transport_reason": reason,
        });
        all_items.push(item.clone());
        if best == Transport::Webhook {
            webhook_preferred.push(item);
        } else {
            websocket_preferred.push(item);
        }
    }
    let unique_event_types: std::collections::HashSet<&str> =
        catalog::CATALOG.iter().map(|entry| entry.event_type).collect();
    Json(json!({
        "source_url": catalog::SOURCE_URL,
        "source_snapshot_date": catalog::SOURCE_SNAPSHOT_DATE,
        "total_items": all_items.len(),
        "total_unique_event_types": unique_event_types.len(),
        "webhook_preferred": webhook_preferred,
        "websocket_preferred": websocket_preferred,
        "all_items": all_items,
    }))
    .into_response()
}
