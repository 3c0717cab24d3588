//! Upstream Twitch client: OAuth token endpoints plus the Helix surface the
//! bridge consumes.
//!
//! Every call builds a fresh HTTP client with a 20 s timeout; the only state
//! is the cached app access token behind a mutex. Non-2xx responses become
//! [`TwitchError::Api`] carrying the body, which downstream classification
//! matches on.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const AUTHORIZE_URL: &str = "https://id.twitch.tv/oauth2/authorize";
const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const HELIX_BASE: &str = "https://api.twitch.tv/helix";

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);
/// Refresh the cached app token this long before it actually expires.
const APP_TOKEN_SKEW_SECONDS: i64 = 60;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TwitchError {
    /// Connection / timeout / TLS failures.
    Transport(String),
    /// Twitch answered with a non-success status.
    Api { status: u16, body: String },
    /// The response body did not have the expected shape.
    Decode(String),
}

impl std::fmt::Display for TwitchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TwitchError::Transport(s) => write!(f, "Twitch transport error: {s}"),
            TwitchError::Api { status, body } => write!(f, "Twitch API error ({status}): {body}"),
            TwitchError::Decode(s) => write!(f, "Twitch response decode error: {s}"),
        }
    }
}

impl std::error::Error for TwitchError {}

impl TwitchError {
    /// Deleting a subscription that is already gone counts as success.
    pub fn is_subscription_not_found(&self) -> bool {
        match self {
            TwitchError::Api { status, body } => {
                let body = body.to_ascii_lowercase();
                *status == 404 || body.contains("not found") || body.contains("does not exist")
            }
            _ => false,
        }
    }

    /// A websocket-bound create raced a session teardown; recoverable by
    /// waiting for the next welcome.
    pub fn is_stale_websocket_session(&self) -> bool {
        match self {
            TwitchError::Api { body, .. } => {
                let body = body.to_ascii_lowercase();
                body.contains("session does not exist") || body.contains("has already disconnected")
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatedToken {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

struct CachedAppToken {
    token: String,
    expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TwitchClient {
    pub client_id: String,
    client_secret: String,
    redirect_uri: String,
    pub scopes: String,
    pub eventsub_ws_url: String,
    token_url: String,
    validate_url: String,
    helix_base: String,
    app_token: Mutex<Option<CachedAppToken>>,
}

impl TwitchClient {
    pub fn new(
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        scopes: String,
        eventsub_ws_url: String,
    ) -> Self {
        TwitchClient {
            client_id,
            client_secret,
            redirect_uri,
            scopes,
            eventsub_ws_url,
            token_url: TOKEN_URL.to_owned(),
            validate_url: VALIDATE_URL.to_owned(),
            helix_base: HELIX_BASE.to_owned(),
            app_token: Mutex::new(None),
        }
    }

    /// Point the client at alternate OAuth/Helix endpoints. Production keeps
    /// the defaults; the integration suite aims this at a local stand-in.
    pub fn with_endpoints(
        mut self,
        token_url: String,
        validate_url: String,
        helix_base: String,
    ) -> Self {
        self.token_url = token_url;
        self.validate_url = validate_url;
        self.helix_base = helix_base;
        self
    }

    fn http(&self) -> Result<reqwest::Client, TwitchError> {
        reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TwitchError::Transport(e.to_string()))
    }

    pub fn build_authorize_url(&self, state: &str) -> String {
        self.build_authorize_url_with_scopes(state, &self.scopes, true)
    }

    pub fn build_authorize_url_with_scopes(
        &self,
        state: &str,
        scopes: &str,
        force_verify: bool,
    ) -> String {
        let url = reqwest::Url::parse_with_params(
            AUTHORIZE_URL,
            [
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scopes),
                ("state", state),
                ("force_verify", if force_verify { "true" } else { "false" }),
            ],
        )
        .expect("authorize URL is statically valid");
        url.to_string()
    }

    async fn post_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse, TwitchError> {
        let response = self
            .http()?
            .post(self.token_url.as_str())
            .query(params)
            .send()
            .await
            .map_err(|e| TwitchError::Transport(e.to_string()))?;
        into_json(response).await?.pipe_decode()
    }

    pub async fn exchange_code(&self, code: &str) -> Result<OAuthToken, TwitchError> {
        let token = self
            .post_token(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .await?;
        let refresh = token
            .refresh_token
            .ok_or_else(|| TwitchError::Decode("missing refresh_token".to_owned()))?;
        Ok(OAuthToken {
            access_token: token.access_token,
            refresh_token: refresh,
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in),
        })
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, TwitchError> {
        let token = self
            .post_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .await?;
        Ok(OAuthToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token.unwrap_or_else(|| refresh_token.to_owned()),
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in),
        })
    }

    pub async fn validate_user_token(
        &self,
        access_token: &str,
    ) -> Result<ValidatedToken, TwitchError> {
        let response = self
            .http()?
            .get(self.validate_url.as_str())
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await
            .map_err(|e| TwitchError::Transport(e.to_string()))?;
        let value = into_json(response).await?.value;
        serde_json::from_value(value).map_err(|e| TwitchError::Decode(e.to_string()))
    }

    pub async fn app_access_token(&self) -> Result<String, TwitchError> {
        {
            let cached = self.app_token.lock().await;
            if let Some(entry) = cached.as_ref() {
                if Utc::now() < entry.expires_at {
                    return Ok(entry.token.clone());
                }
            }
        }
        let token = self
            .post_token(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .await?;
        let expires_at =
            Utc::now() + ChronoDuration::seconds(token.expires_in - APP_TOKEN_SKEW_SECONDS);
        let mut cached = self.app_token.lock().await;
        *cached = Some(CachedAppToken { token: token.access_token.clone(), expires_at });
        Ok(token.access_token)
    }

    async fn helix_get(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, TwitchError> {
        let response = self
            .http()?
            .get(format!("{}{path}", self.helix_base))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Client-Id", &self.client_id)
            .query(query)
            .send()
            .await
            .map_err(|e| TwitchError::Transport(e.to_string()))?;
        Ok(into_json(response).await?.value)
    }

    pub async fn get_users(&self, access_token: &str) -> Result<Vec<Value>, TwitchError> {
        let value = self.helix_get(access_token, "/users", &[]).await?;
        Ok(data_rows(&value))
    }

    pub async fn get_users_by_query(
        &self,
        access_token: &str,
        user_ids: &[String],
        logins: &[String],
    ) -> Result<Vec<Value>, TwitchError> {
        if user_ids.is_empty() && logins.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: Vec<(&str, String)> = Vec::new();
        for id in user_ids {
            query.push(("id", id.clone()));
        }
        for login in logins {
            query.push(("login", login.clone()));
        }
        let value = self.helix_get(access_token, "/users", &query).await?;
        Ok(data_rows(&value))
    }

    pub async fn get_user_by_login_app(&self, login: &str) -> Result<Option<Value>, TwitchError> {
        let token = self.app_access_token().await?;
        let value = self.helix_get(&token, "/users", &[("login", login.to_owned())]).await?;
        Ok(data_rows(&value).into_iter().next())
    }

    pub async fn get_user_by_id_app(&self, user_id: &str) -> Result<Option<Value>, TwitchError> {
        let token = self.app_access_token().await?;
        let value = self.helix_get(&token, "/users", &[("id", user_id.to_owned())]).await?;
        Ok(data_rows(&value).into_iter().next())
    }

    pub async fn get_streams_by_user_ids(
        &self,
        access_token: &str,
        user_ids: &[String],
    ) -> Result<Vec<Value>, TwitchError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query: Vec<(&str, String)> =
            user_ids.iter().map(|id| ("user_id", id.clone())).collect();
        let value = self.helix_get(access_token, "/streams", &query).await?;
        Ok(data_rows(&value))
    }

    /// Follows the pagination cursor to completion.
    pub async fn list_eventsub_subscriptions(
        &self,
        access_token: Option<&str>,
    ) -> Result<Vec<Value>, TwitchError> {
        let token = match access_token {
            Some(t) => t.to_owned(),
            None => self.app_access_token().await?,
        };
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(after) = &cursor {
                query.push(("after", after.clone()));
            }
            let value = self.helix_get(&token, "/eventsub/subscriptions", &query).await?;
            out.extend(data_rows(&value));
            cursor = value
                .get("pagination")
                .and_then(|p| p.get("cursor"))
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_owned);
            if cursor.is_none() {
                break;
            }
        }
        Ok(out)
    }

    /// Create a subscription. A 409 "already exists" is resolved by listing
    /// and returning the matching subscription, making the call idempotent;
    /// when the probe cannot find a match the original 409 is surfaced.
    pub async fn create_eventsub_subscription(
        &self,
        event_type: &str,
        version: &str,
        condition: &Value,
        transport: &Value,
        access_token: Option<&str>,
    ) -> Result<Value, TwitchError> {
        let token = match access_token {
            Some(t) => t.to_owned(),
            None => self.app_access_token().await?,
        };
        let body = json!({
            "type": event_type,
            "version": version,
            "condition": condition,
            "transport": transport,
        });
        let response = self
            .http()?
            .post(format!("{}/eventsub/subscriptions", self.helix_base))
            .header("Authorization", format!("Bearer {token}"))
            .header("Client-Id", &self.client_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| TwitchError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| TwitchError::Transport(e.to_string()))?;
        if status.as_u16() == 409 {
            if let Ok(subs) = self.list_eventsub_subscriptions(Some(&token)).await {
                for sub in subs {
                    if sub.get("type").and_then(Value::as_str) != Some(event_type) {
                        continue;
                    }
                    // version may be absent in some payloads; only enforce when present
                    if let Some(sub_version) = sub.get("version").and_then(Value::as_str) {
                        if sub_version != version {
                            continue;
                        }
                    }
                    let existing_condition = sub.get("condition").cloned().unwrap_or(Value::Null);
                    let existing_transport = sub.get("transport").cloned().unwrap_or(Value::Null);
                    if condition_matches(&existing_condition, condition)
                        && transport_matches(&existing_transport, transport)
                    {
                        return Ok(sub);
                    }
                }
            }
            return Err(TwitchError::Api { status: 409, body: text });
        }
        if !status.is_success() {
            return Err(TwitchError::Api { status: status.as_u16(), body: text });
        }
        let value: Value =
            serde_json::from_str(&text).map_err(|e| TwitchError::Decode(e.to_string()))?;
        data_rows(&value)
            .into_iter()
            .next()
            .ok_or_else(|| TwitchError::Decode("empty create subscription response".to_owned()))
    }

    pub async fn delete_eventsub_subscription(
        &self,
        subscription_id: &str,
        access_token: Option<&str>,
    ) -> Result<(), TwitchError> {
        let token = match access_token {
            Some(t) => t.to_owned(),
            None => self.app_access_token().await?,
        };
        let response = self
            .http()?
            .delete(format!("{}/eventsub/subscriptions", self.helix_base))
            .header("Authorization", format!("Bearer {token}"))
            .header("Client-Id", &self.client_id)
            .query(&[("id", subscription_id)])
            .send()
            .await
            .map_err(|e| TwitchError::Transport(e.to_string()))?;
        expect_success(response).await
    }

    pub async fn send_chat_message(
        &self,
        access_token: &str,
        broadcaster_id: &str,
        sender_id: &str,
        message: &str,
        reply_parent_message_id: Option<&str>,
    ) -> Result<Value, TwitchError> {
        let mut body = json!({
            "broadcaster_id": broadcaster_id,
            "sender_id": sender_id,
            "message": message,
        });
        if let Some(reply_to) = reply_parent_message_id {
            body["reply_parent_message_id"] = json!(reply_to);
        }
        let response = self
            .http()?
            .post(format!("{}/chat/messages", self.helix_base))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Client-Id", &self.client_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| TwitchError::Transport(e.to_string()))?;
        let value = into_json(response).await?.value;
        data_rows(&value)
            .into_iter()
            .next()
            .ok_or_else(|| TwitchError::Decode("empty send chat message response".to_owned()))
    }

    pub async fn create_clip(
        &self,
        access_token: &str,
        broadcaster_id: &str,
        title: &str,
        duration: f64,
        has_delay: bool,
    ) -> Result<Value, TwitchError> {
        let response = self
            .http()?
            .post(format!("{}/clips", self.helix_base))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Client-Id", &self.client_id)
            .query(&[
                ("broadcaster_id", broadcaster_id.to_owned()),
                ("title", title.to_owned()),
                ("duration", duration.to_string()),
                ("has_delay", if has_delay { "true" } else { "false" }.to_owned()),
            ])
            .send()
            .await
            .map_err(|e| TwitchError::Transport(e.to_string()))?;
        let value = into_json(response).await?.value;
        data_rows(&value)
            .into_iter()
            .next()
            .ok_or_else(|| TwitchError::Decode("empty create clip response".to_owned()))
    }

    pub async fn get_clips(
        &self,
        access_token: &str,
        clip_ids: &[String],
    ) -> Result<Vec<Value>, TwitchError> {
        if clip_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query: Vec<(&str, String)> = clip_ids.iter().map(|id| ("id", id.clone())).collect();
        let value = self.helix_get(access_token, "/clips", &query).await?;
        Ok(data_rows(&value))
    }

    pub async fn get_global_chat_badges(&self, access_token: &str) -> Result<Value, TwitchError> {
        self.helix_get(access_token, "/chat/badges/global", &[]).await
    }

    pub async fn get_channel_chat_badges(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<Value, TwitchError> {
        self.helix_get(
            access_token,
            "/chat/badges",
            &[("broadcaster_id", broadcaster_id.to_owned())],
        )
        .await
    }

    pub async fn get_global_emotes(&self, access_token: &str) -> Result<Value, TwitchError> {
        self.helix_get(access_token, "/chat/emotes/global", &[]).await
    }

    pub async fn get_channel_emotes(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<Value, TwitchError> {
        self.helix_get(
            access_token,
            "/chat/emotes",
            &[("broadcaster_id", broadcaster_id.to_owned())],
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Response plumbing
// ---------------------------------------------------------------------------

struct JsonBody {
    value: Value,
}

impl JsonBody {
    fn pipe_decode<T: serde::de::DeserializeOwned>(self) -> Result<T, TwitchError> {
        serde_json::from_value(self.value).map_err(|e| TwitchError::Decode(e.to_string()))
    }
}

async fn into_json(response: reqwest::Response) -> Result<JsonBody, TwitchError> {
    let status = response.status();
    let text = response.text().await.map_err(|e| TwitchError::Transport(e.to_string()))?;
    if !status.is_success() {
        return Err(TwitchError::Api { status: status.as_u16(), body: text });
    }
    let value: Value =
        serde_json::from_str(&text).map_err(|e| TwitchError::Decode(e.to_string()))?;
    Ok(JsonBody { value })
}

async fn expect_success(response: reqwest::Response) -> Result<(), TwitchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let text = response.text().await.map_err(|e| TwitchError::Transport(e.to_string()))?;
    Err(TwitchError::Api { status: status.as_u16(), body: text })
}

fn data_rows(value: &Value) -> Vec<Value> {
    value.get("data").and_then(Value::as_array).cloned().unwrap_or_default()
}

/// Every desired condition key must match the existing subscription exactly.
fn condition_matches(existing: &Value, desired: &Value) -> bool {
    let Some(desired_map) = desired.as_object() else { return false };
    desired_map.iter().all(|(key, want)| {
        let have = existing.get(key).map(value_as_string).unwrap_or_default();
        have == value_as_string(want)
    })
}

/// The transport matches when the method agrees and any session/callback the
/// caller pinned agrees too.
fn transport_matches(existing: &Value, desired: &Value) -> bool {
    let method = desired.get("method").map(value_as_string).unwrap_or_default();
    if existing.get("method").map(value_as_string).unwrap_or_default() != method {
        return false;
    }
    if method == "websocket" {
        let desired_session = desired.get("session_id").map(value_as_string).unwrap_or_default();
        if !desired_session.is_empty() {
            let existing_session =
                existing.get("session_id").map(value_as_string).unwrap_or_default();
            if existing_session != desired_session {
                return false;
            }
        }
    }
    if method == "webhook" {
        let desired_callback = desired.get("callback").map(value_as_string).unwrap_or_default();
        if !desired_callback.is_empty() {
            let existing_callback =
                existing.get("callback").map(value_as_string).unwrap_or_default();
            if existing_callback != desired_callback {
                return false;
            }
        }
    }
    true
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TwitchClient {
        TwitchClient::new(
            "cid".to_owned(),
            "csecret".to_owned(),
            "https://example.com/cb".to_owned(),
            "chat:read chat:edit".to_owned(),
            "wss://eventsub.wss.twitch.tv/ws".to_owned(),
        )
    }

    #[test]
    fn authorize_url_carries_every_parameter() {
        let url = client().build_authorize_url_with_scopes("st-1", "chat:read chat:edit", true);
        assert!(url.starts_with("https://id.twitch.tv/oauth2/authorize?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("state=st-1"));
        assert!(url.contains("force_verify=true"));
        assert!(url.contains("scope=chat%3Aread+chat%3Aedit") || url.contains("scope=chat%3Aread%20chat%3Aedit"));
    }

    #[test]
    fn condition_match_requires_every_desired_key() {
        let existing = json!({"broadcaster_user_id": "222", "user_id": "111"});
        assert!(condition_matches(&existing, &json!({"broadcaster_user_id": "222"})));
        assert!(condition_matches(
            &existing,
            &json!({"broadcaster_user_id": "222", "user_id": "111"})
        ));
        assert!(!condition_matches(&existing, &json!({"broadcaster_user_id": "333"})));
        assert!(!condition_matches(&existing, &json!({"missing": "x"})));
    }

    #[test]
    fn transport_match_pins_session_for_websocket() {
        let existing = json!({"method": "websocket", "session_id": "sess-a"});
        assert!(transport_matches(
            &existing,
            &json!({"method": "websocket", "session_id": "sess-a"})
        ));
        assert!(!transport_matches(
            &existing,
            &json!({"method": "websocket", "session_id": "sess-b"})
        ));
        // no pinned session -> method match is enough
        assert!(transport_matches(&existing, &json!({"method": "websocket"})));
        assert!(!transport_matches(&existing, &json!({"method": "webhook"})));
    }

    #[test]
    fn transport_match_pins_callback_for_webhook() {
        let existing = json!({"method": "webhook", "callback": "https://cb.example.com/hook"});
        assert!(transport_matches(
            &existing,
            &json!({"method": "webhook", "callback": "https://cb.example.com/hook"})
        ));
        assert!(!transport_matches(
            &existing,
            &json!({"method": "webhook", "callback": "https://other.example.com/hook"})
        ));
    }

    #[test]
    fn not_found_classification_reads_status_and_body() {
        let by_status = TwitchError::Api { status: 404, body: "gone".to_owned() };
        let by_body = TwitchError::Api {
            status: 400,
            body: "subscription does not exist".to_owned(),
        };
        let other = TwitchError::Api { status: 500, body: "boom".to_owned() };
        assert!(by_status.is_subscription_not_found());
        assert!(by_body.is_subscription_not_found());
        assert!(!other.is_subscription_not_found());
    }

    #[test]
    fn stale_session_classification() {
        let stale = TwitchError::Api {
            status: 400,
            body: "websocket transport session does not exist".to_owned(),
        };
        let disconnected = TwitchError::Api {
            status: 400,
            body: "the websocket has already disconnected".to_owned(),
        };
        assert!(stale.is_stale_websocket_session());
        assert!(disconnected.is_stale_websocket_session());
        assert!(!TwitchError::Transport("timeout".to_owned()).is_stale_websocket_session());
    }
}
