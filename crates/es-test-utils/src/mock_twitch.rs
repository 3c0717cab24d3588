//! In-process stand-in for the Twitch OAuth + Helix surface the bridge
//! consumes, with call recording for assertions.
//!
//! Create rows echo the requested type/version/condition/transport (minus
//! the webhook secret, as Twitch does), get ids `mock-sub-<n>`, and land in
//! the listing until deleted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Default)]
struct MockTwitchState {
    subscriptions: Vec<Value>,
    created: Vec<Value>,
    deleted: Vec<String>,
    validate_scopes: Vec<String>,
    next_id: u64,
}

#[derive(Clone)]
struct Shared(Arc<Mutex<MockTwitchState>>);

pub struct MockTwitch {
    addr: SocketAddr,
    state: Arc<Mutex<MockTwitchState>>,
}

impl MockTwitch {
    pub async fn start() -> std::io::Result<MockTwitch> {
        let state = Arc::new(Mutex::new(MockTwitchState::default()));
        let router = Router::new()
            .route("/oauth2/token", post(token))
            .route("/oauth2/validate", get(validate))
            .route(
                "/helix/eventsub/subscriptions",
                get(list_subscriptions)
                    .post(create_subscription)
                    .delete(delete_subscription),
            )
            .route("/helix/streams", get(empty_data))
            .route("/helix/users", get(empty_data))
            .route("/helix/chat/badges/global", get(empty_data))
            .route("/helix/chat/badges", get(empty_data))
            .route("/helix/chat/emotes/global", get(empty_data))
            .route("/helix/chat/emotes", get(empty_data))
            .with_state(Shared(Arc::clone(&state)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock twitch server failed");
        });
        Ok(MockTwitch { addr, state })
    }

    pub fn token_url(&self) -> String {
        format!("http://{}/oauth2/token", self.addr)
    }

    pub fn validate_url(&self) -> String {
        format!("http://{}/oauth2/validate", self.addr)
    }

    pub fn helix_base(&self) -> String {
        format!("http://{}/helix", self.addr)
    }

    /// Add a subscription row the next listing will return.
    pub fn seed_subscription(&self, subscription: Value) {
        self.state.lock().unwrap().subscriptions.push(subscription);
    }

    /// Scopes reported by `GET /oauth2/validate`.
    pub fn set_validate_scopes(&self, scopes: &[&str]) {
        self.state.lock().unwrap().validate_scopes =
            scopes.iter().map(|s| (*s).to_owned()).collect();
    }

    /// Bodies of every create call, in order, as the returned rows.
    pub fn created(&self) -> Vec<Value> {
        self.state.lock().unwrap().created.clone()
    }

    /// Ids passed to every delete call, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    /// The rows a listing would currently return.
    pub fn subscriptions(&self) -> Vec<Value> {
        self.state.lock().unwrap().subscriptions.clone()
    }
}

async fn token() -> Json<Value> {
    Json(json!({
        "access_token": "mock-app-token",
        "refresh_token": "mock-refresh-token",
        "expires_in": 3600,
    }))
}

async fn validate(State(Shared(state)): State<Shared>) -> Json<Value> {
    let scopes = state.lock().unwrap().validate_scopes.clone();
    Json(json!({
        "user_id": "0",
        "login": "mock",
        "scopes": scopes,
        "expires_in": 3600,
    }))
}

async fn list_subscriptions(State(Shared(state)): State<Shared>) -> Json<Value> {
    let subscriptions = state.lock().unwrap().subscriptions.clone();
    Json(json!({"data": subscriptions, "pagination": {}}))
}

async fn create_subscription(
    State(Shared(state)): State<Shared>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let mut locked = state.lock().unwrap();
    locked.next_id += 1;
    let id = format!("mock-sub-{}", locked.next_id);
    let mut transport = body.get("transport").cloned().unwrap_or_else(|| json!({}));
    if let Some(map) = transport.as_object_mut() {
        map.remove("secret");
        map.insert("connected_at".to_owned(), json!("2026-02-17T00:00:00Z"));
    }
    let row = json!({
        "id": id,
        "status": "enabled",
        "type": body.get("type").cloned().unwrap_or(Value::Null),
        "version": body.get("version").cloned().unwrap_or(Value::Null),
        "condition": body.get("condition").cloned().unwrap_or_else(|| json!({})),
        "transport": transport,
    });
    locked.created.push(row.clone());
    locked.subscriptions.push(row.clone());
    Json(json!({"data": [row]}))
}

async fn delete_subscription(
    State(Shared(state)): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let id = params.get("id").cloned().unwrap_or_default();
    let mut locked = state.lock().unwrap();
    locked
        .subscriptions
        .retain(|sub| sub.get("id").and_then(Value::as_str) != Some(id.as_str()));
    locked.deleted.push(id);
    StatusCode::NO_CONTENT
}

async fn empty_data() -> Json<Value> {
    Json(json!({"data": []}))
}
