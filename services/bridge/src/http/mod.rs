//! Downstream HTTP API: admin surface, consumer surface, and the upstream
//! webhook ingress.

pub mod admin;
pub mod bots;
pub mod catalog;
pub mod interests;
pub mod response;
pub mod subscriptions;
pub mod webhook;
pub mod ws_token;

use axum::http::HeaderMap;
use tracing::debug;

use crate::auth::{self, AuthFailure};
use crate::repo::consumers::ConsumerRow;
use crate::state::AppState;
use response::{unauthorized, HttpResponse};

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// Operator gate: `X-Admin-Key` must equal the configured admin key.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), HttpResponse> {
    let presented = header_value(headers, "x-admin-key");
    if presented.is_empty() || presented != state.settings.admin_api_key {
        return Err(unauthorized("Invalid admin key"));
    }
    Ok(())
}

/// Consumer gate: `X-Client-Id` / `X-Client-Secret` resolve to an enabled
/// consumer. Also bumps the consumer's API-request counters.
pub(crate) async fn require_consumer(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<ConsumerRow, HttpResponse> {
    let client_id = header_value(headers, "x-client-id");
    let client_secret = header_value(headers, "x-client-secret");
    let consumer = auth::authenticate_consumer(&state.pool, client_id, client_secret)
        .await
        .map_err(|failure| match failure {
            AuthFailure::BadCredentials => unauthorized("Invalid service credentials"),
            AuthFailure::Store(err) => response::internal_error(err),
        })?;
    if let Err(err) = crate::repo::stats::record_api_request(&state.pool, consumer.id).await {
        debug!(consumer_id = %consumer.id, error = %err, "failed recording api request stat");
    }
    Ok(consumer)
}
