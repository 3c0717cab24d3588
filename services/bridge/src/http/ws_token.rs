//! Single-use downstream-WS handshake tokens.

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde_json::json;

use super::require_consumer;
use crate::state::AppState;

pub async fn create_ws_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let consumer = match require_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(response) => return response,
    };
    let (ws_token, expires_in_seconds) = state.ws_tokens.issue(consumer.id);
    // Legacy clients read `token` / `wsToken`; keep all three spellings.
    let payload = json!({
        "ws_token": &ws_token,
        "token": &ws_token,
        "wsToken": &ws_token,
        "expires_in_seconds": expires_in_seconds,
    });
    state
        .manager
        .record_trace(
            consumer.id,
            "outgoing",
            "http",
            "service.ws_token.issued",
            Some("/v1/ws-token"),
            &payload,
        )
        .await;
    Json(payload).into_response()
}
