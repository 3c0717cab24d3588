//! Consumer views over declared interests and live upstream subscriptions.

use std::collections::{BTreeMap, HashMap};

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::interests::working_interests_for;
use super::response::internal_error;
use super::require_consumer;
use crate::repo::access;
use crate::state::AppState;

pub async fn list_consumer_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    let interests = match working_interests_for(&state, consumer.id).await {
        Ok(interests) => interests,
        Err(err) => return internal_error(err),
    };
    let items: Vec<_> = interests
        .iter()
        .map(|interest| {
            json!({
                "interest_id": interest.id,
                "bot_id": interest.bot_id,
                "event_type": interest.event_type,
                "broadcaster_user_id": interest.broadcaster_user_id,
                "local_transport": interest.transport,
                "webhook_url": interest.webhook_url,
                "created_at": interest.created_at,
                "updated_at": interest.updated_at,
            })
        })
        .collect();
    Json(json!({"total": items.len(), "items": items})).into_response()
}

pub async fn list_subscription_transports(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    let interests = match working_interests_for(&state, consumer.id).await {
        Ok(interests) => interests,
        Err(err) => return internal_error(err),
    };
    let mut by_transport: HashMap<&str, usize> = HashMap::from([("websocket", 0), ("webhook", 0)]);
    let mut by_event_type: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for interest in &interests {
        let transport =
            if interest.transport == "webhook" { "webhook" } else { "websocket" };
        *by_transport.entry(transport).or_default() += 1;
        let entry = by_event_type.entry(interest.event_type.clone()).or_default();
        if transport == "webhook" {
            entry.1 += 1;
        } else {
            entry.0 += 1;
        }
    }
    let rows: Vec<_> = by_event_type
        .iter()
        .map(|(event_type, (websocket, webhook))| {
            json!({"event_type": event_type, "websocket": websocket, "webhook": webhook})
        })
        .collect();
    Json(json!({
        "total_subscriptions": interests.len(),
        "by_transport": {
            "websocket": by_transport["websocket"],
            "webhook": by_transport["webhook"],
        },
        "by_event_type": rows,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct ActiveQuery {
    #[serde(default)]
    pub refresh: bool,
}

/// Live upstream subscriptions that back this consumer's interests,
/// served from a briefly cached merged listing.
pub async fn list_active_upstream_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ActiveQuery>,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    let (snapshot, cached_at, from_cache) =
        state.manager.active_subscriptions_snapshot(query.refresh).await;
    let allowed = match access::allowed_bot_ids(&state.pool, consumer.id).await {
        Ok(allowed) => allowed,
        Err(err) => return internal_error(err),
    };
    let interests = match working_interests_for(&state, consumer.id).await {
        Ok(interests) => interests,
        Err(err) => return internal_error(err),
    };
    let mut interest_ids_by_key: HashMap<(Uuid, &str, &str), Vec<Uuid>> = HashMap::new();
    for interest in &interests {
        interest_ids_by_key
            .entry((
                interest.bot_id,
                interest.event_type.as_str(),
                interest.broadcaster_user_id.as_str(),
            ))
            .or_default()
            .push(interest.id);
    }

    let items: Vec<_> = snapshot
        .iter()
        .filter(|row| row.status.starts_with("enabled"))
        .filter(|row| allowed.is_empty() || allowed.contains(&row.bot_id))
        .filter_map(|row| {
            let matched = interest_ids_by_key.get(&(
                row.bot_id,
                row.event_type.as_str(),
                row.broadcaster_user_id.as_str(),
            ))?;
            Some(json!({
                "twitch_subscription_id": row.twitch_subscription_id,
                "status": row.status,
                "event_type": row.event_type,
                "broadcaster_user_id": row.broadcaster_user_id,
                "upstream_transport": row.upstream_transport,
                "bot_id": row.bot_id,
                "matched_interest_ids": matched,
                "session_id": row.session_id,
                "connected_at": row.connected_at,
                "disconnected_at": row.disconnected_at,
            }))
        })
        .collect();

    Json(json!({
        "source": if from_cache { "cache" } else { "twitch_live" },
        "cached_at": cached_at,
        "total_from_twitch": snapshot.len(),
        "matched_for_consumer": items.len(),
        "items": items,
    }))
    .into_response()
}
