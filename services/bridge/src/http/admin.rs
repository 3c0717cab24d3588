//! Operator endpoints: consumer account management.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::response::{conflict, internal_error, not_found, unprocessable};
use super::require_admin;
use crate::auth::{generate_client_id, generate_client_secret, hash_secret};
use crate::repo::{self, consumers};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateConsumerRequest {
    pub name: String,
}

pub async fn create_consumer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateConsumerRequest>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    let name = body.name.trim().to_owned();
    if name.is_empty() {
        return unprocessable("name must not be empty");
    }
    let client_id = generate_client_id();
    let client_secret = generate_client_secret();
    match consumers::insert(&state.pool, &name, &client_id, &hash_secret(&client_secret)).await {
        Ok(consumer) => Json(json!({
            "id": consumer.id,
            "name": consumer.name,
            "client_id": client_id,
            // The plaintext secret is returned exactly once.
            "client_secret": client_secret,
        }))
        .into_response(),
        Err(err) if repo::is_unique_violation(&err) => {
            conflict(format!("consumer '{name}' already exists"))
        }
        Err(err) => internal_error(err),
    }
}

pub async fn list_consumers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    match consumers::list_all(&state.pool).await {
        Ok(rows) => Json(
            rows.iter()
                .map(|consumer| {
                    json!({
                        "id": consumer.id,
                        "name": consumer.name,
                        "client_id": consumer.client_id,
                        "enabled": consumer.enabled,
                        "created_at": consumer.created_at,
                    })
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn regenerate_consumer_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    let new_secret = generate_client_secret();
    match consumers::set_secret_hash(&state.pool, &client_id, &hash_secret(&new_secret)).await {
        Ok(true) => Json(json!({
            "client_id": client_id,
            "client_secret": new_secret,
        }))
        .into_response(),
        Ok(false) => not_found("Consumer account not found"),
        Err(err) => internal_error(err),
    }
}
