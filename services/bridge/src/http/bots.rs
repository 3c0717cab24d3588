//! Bot visibility endpoints.

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde_json::json;

use super::response::internal_error;
use super::{require_admin, require_consumer};
use crate::repo::{access, bots};
use crate::state::AppState;

pub async fn list_bots(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    match bots::list_all(&state.pool).await {
        Ok(rows) => Json(
            rows.iter()
                .map(|bot| {
                    json!({
                        "id": bot.id,
                        "name": bot.name,
                        "twitch_user_id": bot.twitch_user_id,
                        "twitch_login": bot.twitch_login,
                        "enabled": bot.enabled,
                        "token_expires_at": bot.token_expires_at,
                    })
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => internal_error(err),
    }
}

/// The enabled bots this consumer may register interests through. An empty
/// access table means every enabled bot is fair game.
pub async fn list_accessible_bots(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    let allowed = match access::allowed_bot_ids(&state.pool, consumer.id).await {
        Ok(allowed) => allowed,
        Err(err) => return internal_error(err),
    };
    let rows = match bots::list_enabled(&state.pool).await {
        Ok(rows) => rows,
        Err(err) => return internal_error(err),
    };
    let access_mode = if allowed.is_empty() { "all" } else { "restricted" };
    let bots: Vec<_> = rows
        .iter()
        .filter(|bot| allowed.is_empty() || allowed.contains(&bot.id))
        .map(|bot| {
            json!({
                "id": bot.id,
                "name": bot.name,
                "twitch_user_id": bot.twitch_user_id,
                "twitch_login": bot.twitch_login,
                "enabled": bot.enabled,
            })
        })
        .collect();
    Json(json!({"access_mode": access_mode, "bots": bots})).into_response()
}
