//! Consumer interest endpoints: declare, list, heartbeat, delete.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::response::{
    bad_gateway, conflict, forbidden, internal_error, not_found, unprocessable, HttpResponse,
};
use super::require_consumer;
use crate::catalog;
use crate::eventsub::ensure::{failure_is_pending_authorization, EnsureOutcome};
use crate::net;
use crate::normalize::normalize_broadcaster_id_or_login;
use crate::repo::{self, access, bots, channel_states, interests};
use crate::repo::consumers::ConsumerRow;
use crate::repo::interests::InterestRow;
use crate::state::AppState;

const STREAM_STATE_EVENTS: [&str; 2] = ["stream.online", "stream.offline"];

#[derive(Deserialize)]
pub struct CreateInterestRequest {
    pub bot_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_transport() -> String {
    "websocket".to_owned()
}

/// Interests whose bot is missing or disabled are hidden from listings;
/// they stay in the store until the GC or an explicit delete removes them.
async fn filter_working_interests(
    state: &AppState,
    interests: Vec<InterestRow>,
) -> Result<Vec<InterestRow>, sqlx::Error> {
    let enabled: std::collections::HashSet<Uuid> =
        bots::list_enabled(&state.pool).await?.into_iter().map(|bot| bot.id).collect();
    Ok(interests.into_iter().filter(|interest| enabled.contains(&interest.bot_id)).collect())
}

pub(crate) async fn working_interests_for(
    state: &AppState,
    consumer_id: Uuid,
) -> Result<Vec<InterestRow>, sqlx::Error> {
    let rows = interests::list_for_consumer(&state.pool, consumer_id).await?;
    filter_working_interests(state, rows).await
}

pub async fn list_interests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    match working_interests_for(&state, consumer.id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn create_interest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateInterestRequest>,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    match create_interest_inner(&state, &consumer, body).await {
        Ok(interest) => Json(interest).into_response(),
        Err(response) => response,
    }
}

async fn create_interest_inner(
    state: &AppState,
    consumer: &ConsumerRow,
    body: CreateInterestRequest,
) -> Result<InterestRow, HttpResponse> {
    let event_type = body.event_type.trim().to_ascii_lowercase();
    if !catalog::is_known_event_type(&event_type) {
        return Err(unprocessable(format!(
            "Unsupported event_type '{}'. See GET /v1/eventsub/subscription-types.",
            body.event_type
        )));
    }
    let transport = body.transport.trim().to_ascii_lowercase();
    if transport != "websocket" && transport != "webhook" {
        return Err(unprocessable("transport must be \"websocket\" or \"webhook\""));
    }
    let webhook_url = body.webhook_url.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if transport == "webhook" {
        let Some(url) = webhook_url else {
            return Err(unprocessable("webhook_url is required for webhook transport"));
        };
        net::validate_webhook_target(
            url,
            &state.webhook_allowlist,
            state.settings.app_block_private_webhook_targets,
        )
        .await
        .map_err(unprocessable)?;
    }

    let raw_broadcaster = normalize_broadcaster_id_or_login(&body.broadcaster_user_id);
    if raw_broadcaster.is_empty() {
        return Err(unprocessable("broadcaster_user_id is required"));
    }
    let broadcaster_user_id = if raw_broadcaster.chars().all(|c| c.is_ascii_digit()) {
        raw_broadcaster.clone()
    } else {
        resolve_broadcaster_login(state, &raw_broadcaster.to_ascii_lowercase()).await?
    };

    let bot = bots::get(&state.pool, body.bot_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Bot not found"))?;
    if !bot.enabled {
        return Err(conflict("Bot is disabled"));
    }
    let can_access = access::consumer_can_access_bot(&state.pool, consumer.id, bot.id)
        .await
        .map_err(internal_error)?;
    if !can_access {
        return Err(forbidden("Consumer is not granted access to this bot"));
    }

    // Interests filed under a pre-normalization token migrate to the id.
    if raw_broadcaster != broadcaster_user_id {
        interests::merge_legacy_broadcaster(
            &state.pool,
            consumer.id,
            bot.id,
            &raw_broadcaster,
            &broadcaster_user_id,
        )
        .await
        .map_err(internal_error)?;
        channel_states::merge_legacy_broadcaster(
            &state.pool,
            bot.id,
            &raw_broadcaster,
            &broadcaster_user_id,
        )
        .await
        .map_err(internal_error)?;
        state.manager.load_interests().await;
    }

    let existing = interests::find_exact(
        &state.pool,
        consumer.id,
        bot.id,
        &event_type,
        &broadcaster_user_id,
        &transport,
        webhook_url,
    )
    .await
    .map_err(internal_error)?;

    if let Some(interest) = existing {
        // Re-declaring an interest is a heartbeat.
        interests::touch_related(&state.pool, consumer.id, bot.id, &broadcaster_user_id)
            .await
            .map_err(internal_error)?;
        let refreshed = interests::get(&state.pool, interest.id)
            .await
            .map_err(internal_error)?
            .unwrap_or(interest);
        state.registry.add(&refreshed);
        return Ok(refreshed);
    }

    let interest = match interests::insert(
        &state.pool,
        consumer.id,
        bot.id,
        &event_type,
        &broadcaster_user_id,
        &transport,
        webhook_url,
    )
    .await
    {
        Ok(interest) => interest,
        Err(err) if repo::is_unique_violation(&err) => interests::find_exact(
            &state.pool,
            consumer.id,
            bot.id,
            &event_type,
            &broadcaster_user_id,
            &transport,
            webhook_url,
        )
        .await
        .map_err(internal_error)?
        .ok_or_else(|| conflict("Interest already exists"))?,
        Err(err) => return Err(internal_error(err)),
    };

    let key = state.registry.add(&interest);
    if let EnsureOutcome::Fail(reason) = state.manager.on_interest_added(&key).await {
        warn!(key = %key, reason = %reason, "interest created but upstream ensure failed");
        // A missing broadcaster grant leaves the interest pending: the
        // consumer already received a structured subscription.error and the
        // subscription is retried once authorization lands. Anything else
        // rejects the interest outright.
        if !failure_is_pending_authorization(&reason) {
            state.manager.reject_interests_for_key(&key, &reason, None).await;
            return Err(bad_gateway(format!("Upstream subscription rejected: {reason}")));
        }
    }

    ensure_default_stream_interests(state, consumer, bot.id, &broadcaster_user_id).await;
    Ok(interest)
}

/// Resolve a login (or URL-derived token) to a numeric broadcaster id via
/// Helix.
async fn resolve_broadcaster_login(
    state: &AppState,
    login: &str,
) -> Result<String, HttpResponse> {
    let token = state
        .twitch
        .app_access_token()
        .await
        .map_err(|err| bad_gateway(format!("Failed resolving broadcaster login: {err}")))?;
    let users = state
        .twitch
        .get_users_by_query(&token, &[], &[login.to_owned()])
        .await
        .map_err(|err| bad_gateway(format!("Failed resolving broadcaster login: {err}")))?;
    let Some(user) = users.first() else {
        return Err(not_found("Broadcaster login not found"));
    };
    let id = user.get("id").and_then(Value::as_str).unwrap_or("").trim().to_owned();
    if id.is_empty() {
        return Err(bad_gateway("Twitch user lookup returned empty id"));
    }
    Ok(id)
}

/// Liveness companion interests: whenever a consumer watches any event on a
/// channel, stream.online/offline interests keep ChannelState current. A
/// failure here rejects only the default interest, never the primary one.
async fn ensure_default_stream_interests(
    state: &AppState,
    consumer: &ConsumerRow,
    bot_id: Uuid,
    broadcaster_user_id: &str,
) {
    for stream_event in STREAM_STATE_EVENTS {
        let existing = match interests::find_exact(
            &state.pool,
            consumer.id,
            bot_id,
            stream_event,
            broadcaster_user_id,
            "websocket",
            None,
        )
        .await
        {
            Ok(existing) => existing,
            Err(err) => {
                warn!(error = %err, "failed checking default stream interest");
                continue;
            }
        };
        if existing.is_some() {
            continue;
        }
        let interest = match interests::insert(
            &state.pool,
            consumer.id,
            bot_id,
            stream_event,
            broadcaster_user_id,
            "websocket",
            None,
        )
        .await
        {
            Ok(interest) => interest,
            Err(err) if repo::is_unique_violation(&err) => continue,
            Err(err) => {
                warn!(error = %err, "failed creating default stream interest");
                continue;
            }
        };
        let key = state.registry.add(&interest);
        if let EnsureOutcome::Fail(reason) = state.manager.on_interest_added(&key).await {
            warn!(key = %key, reason = %reason, "default stream interest ensure failed");
            if !failure_is_pending_authorization(&reason) {
                state.manager.reject_interests_for_key(&key, &reason, None).await;
            }
        }
    }
}

pub async fn delete_interest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(interest_id): Path<Uuid>,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    let interest = match interests::get(&state.pool, interest_id).await {
        Ok(Some(interest)) if interest.consumer_id == consumer.id => interest,
        Ok(_) => return not_found("Interest not found"),
        Err(err) => return internal_error(err),
    };
    if let Err(err) = interests::delete(&state.pool, interest_id).await {
        return internal_error(err);
    }
    let (key, still_used) = state.registry.remove(&interest);
    state.manager.on_interest_removed(&key, still_used).await;
    Json(json!({"deleted": true})).into_response()
}

/// Heartbeat one interest: refreshes every interest of the same consumer for
/// the same (bot, broadcaster), clearing any stale marks.
pub async fn heartbeat_interest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(interest_id): Path<Uuid>,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    let interest = match interests::get(&state.pool, interest_id).await {
        Ok(Some(interest)) if interest.consumer_id == consumer.id => interest,
        Ok(_) => return not_found("Interest not found"),
        Err(err) => return internal_error(err),
    };
    match interests::touch_related(
        &state.pool,
        consumer.id,
        interest.bot_id,
        &interest.broadcaster_user_id,
    )
    .await
    {
        Ok(touched) => Json(json!({"ok": true, "touched": touched})).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn heartbeat_all_interests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    match interests::touch_all_for_consumer(&state.pool, consumer.id).await {
        Ok(touched) => Json(json!({"ok": true, "touched": touched})).into_response(),
        Err(err) => internal_error(err),
    }
}
