//! Per-key subscription ensure: bring upstream state to "exactly one enabled
//! subscription for this key, on the chosen transport, with a fresh
//! token/session".

use serde_json::{json, Value};
use tracing::{info, warn};

use super::EventSubManager;
use crate::bot_tokens::ensure_bot_access_token;
use crate::catalog::{self, Transport};
use crate::registry::InterestKey;
use crate::repo;

/// Outcome of an ensure pass.
///
/// `Skip` is the "not now" case (no websocket session, or the session moved
/// while we were working); the session machine retries on the next welcome.
/// `Fail` means interested consumers were already sent a structured
/// `subscription.error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    Done,
    Skip,
    Fail(String),
}

/// Map a failure reason onto the consumer-facing error code and hint.
///
/// Local scope preconditions name the missing scope explicitly and win over
/// the generic authorization wording Twitch itself uses in 403 bodies.
pub fn classify_subscription_failure(reason: &str) -> (&'static str, &'static str) {
    let message = reason.to_ascii_lowercase();
    if message.contains("missing required scope") || message.contains("scope") {
        return (
            "missing_scope",
            "The granting OAuth token is missing a required scope for this subscription type.",
        );
    }
    if message.contains("missing proper authorization") {
        return (
            "insufficient_permissions",
            "Broadcaster authorization for this bot is missing or no longer valid.",
        );
    }
    if message.contains("unauthorized") || message.contains("forbidden") {
        return (
            "unauthorized",
            "Twitch rejected subscription authorization for this bot/condition.",
        );
    }
    ("subscription_create_failed", "Twitch rejected subscription creation for this interest.")
}

/// Failure codes that mean "waiting on an authorization grant": the interest
/// stays in place (the GC will collect it if the grant never arrives), no
/// rejection is sent.
pub fn failure_is_pending_authorization(reason: &str) -> bool {
    matches!(
        classify_subscription_failure(reason).0,
        "missing_scope" | "insufficient_permissions"
    )
}

impl EventSubManager {
    /// Interest creation hook: ensure the upstream subscription, then warm
    /// the chat-asset cache for chat interests.
    pub async fn on_interest_added(&self, key: &InterestKey) -> EnsureOutcome {
        let outcome = self.ensure_subscription(key).await;
        if !matches!(outcome, EnsureOutcome::Fail(_)) && key.event_type.starts_with("channel.chat.")
        {
            self.chat_assets.prefetch(&key.broadcaster_user_id);
        }
        outcome
    }

    /// Interest removal hook: when the key has no other interests left, tear
    /// down the upstream subscription and the cached channel state.
    pub async fn on_interest_removed(&self, key: &InterestKey, still_used: bool) {
        if still_used {
            return;
        }
        let mut delete_token: Option<String> = None;
        if self.transport_for_event(&key.event_type) == Transport::Websocket {
            if let Ok(Some(bot)) = repo::bots::get(&self.pool, key.bot_id).await {
                if bot.enabled {
                    delete_token =
                        ensure_bot_access_token(&self.pool, &self.twitch, &bot).await.ok();
                }
            }
        }
        match repo::subscriptions::get_by_key(&self.pool, key).await {
            Ok(Some(sub)) => {
                if let Err(err) = self
                    .twitch
                    .delete_eventsub_subscription(
                        &sub.twitch_subscription_id,
                        delete_token.as_deref(),
                    )
                    .await
                {
                    if !err.is_subscription_not_found() {
                        warn!(key = %key, error = %err, "failed deleting upstream subscription");
                    }
                }
                if let Err(err) = repo::subscriptions::delete_by_key(&self.pool, key).await {
                    warn!(key = %key, error = %err, "failed deleting local subscription row");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(key = %key, error = %err, "failed loading subscription for teardown"),
        }
        if let Err(err) =
            repo::channel_states::delete(&self.pool, key.bot_id, &key.broadcaster_user_id).await
        {
            warn!(key = %key, error = %err, "failed deleting channel state");
        }
    }

    /// Ensure every currently-desired websocket subscription; called on each
    /// welcome. Stops early when the session disappears mid-way.
    pub(crate) async fn ensure_all_subscriptions(&self) {
        for key in self.registry.keys() {
            if self.transport_for_event(&key.event_type) == Transport::Websocket
                && self.current_session().is_none()
            {
                info!("skipping remaining websocket subscription ensures; session is unavailable");
                break;
            }
            if let EnsureOutcome::Fail(reason) = self.ensure_subscription(&key).await {
                warn!(key = %key, reason = %reason, "failed ensuring subscription");
                // Interests waiting on a broadcaster grant stay pending; the
                // GC collects them if the grant never arrives.
                if !failure_is_pending_authorization(&reason) {
                    self.reject_interests_for_key(
                        &key,
                        &reason,
                        Some(self.transport_for_event(&key.event_type)),
                    )
                    .await;
                }
            }
        }
    }

    /// Ensure the webhook-transport subset; webhook subscriptions do not need
    /// a live websocket session, so this runs at startup too.
    pub(crate) async fn ensure_webhook_subscriptions(&self) {
        for key in self.registry.keys() {
            if self.transport_for_event(&key.event_type) != Transport::Webhook {
                continue;
            }
            if let EnsureOutcome::Fail(reason) = self.ensure_subscription(&key).await {
                warn!(key = %key, reason = %reason, "failed ensuring webhook subscription");
                if !failure_is_pending_authorization(&reason) {
                    self.reject_interests_for_key(&key, &reason, Some(Transport::Webhook)).await;
                }
            }
        }
    }

    /// The bridge's own `user.authorization.revoke` subscription, bound to
    /// the webhook callback. Nothing to do when the callback is unset.
    pub(crate) async fn ensure_authorization_revoke_subscription(&self) {
        let (Some(callback), Some(secret)) = (
            self.settings.twitch_eventsub_webhook_callback_url.clone(),
            self.settings.twitch_eventsub_webhook_secret.clone(),
        ) else {
            warn!("skipping user.authorization.revoke subscription: webhook callback/secret not configured");
            return;
        };
        let existing = match self.twitch.list_eventsub_subscriptions(None).await {
            Ok(subs) => subs,
            Err(err) => {
                warn!(error = %err, "failed listing subscriptions for revoke check");
                return;
            }
        };
        let already_present = existing.iter().any(|sub| {
            sub.get("type").and_then(Value::as_str) == Some("user.authorization.revoke")
                && sub
                    .get("transport")
                    .and_then(|t| t.get("method"))
                    .and_then(Value::as_str)
                    == Some("webhook")
        });
        if already_present {
            return;
        }
        let condition = json!({"client_id": self.twitch.client_id});
        let transport = json!({"method": "webhook", "callback": callback, "secret": secret});
        if let Err(err) = self
            .twitch
            .create_eventsub_subscription("user.authorization.revoke", "1", &condition, &transport, None)
            .await
        {
            warn!(error = %err, "failed creating user.authorization.revoke subscription");
        }
    }

    pub(crate) async fn ensure_subscription(&self, key: &InterestKey) -> EnsureOutcome {
        let _serialized = self.sub_lock.lock().await;
        self.ensure_subscription_locked(key).await
    }

    async fn ensure_subscription_locked(&self, key: &InterestKey) -> EnsureOutcome {
        let upstream_transport = self.transport_for_event(&key.event_type);
        let version = catalog::preferred_version(&key.event_type);
        let session_snapshot = self.current_session();
        if upstream_transport == Transport::Websocket && session_snapshot.is_none() {
            return EnsureOutcome::Skip;
        }

        let existing = match repo::subscriptions::get_by_key(&self.pool, key).await {
            Ok(row) => row,
            Err(err) => return EnsureOutcome::Fail(format!("subscription lookup failed: {err}")),
        };

        // Already conformant?
        if let Some(sub) = &existing {
            if sub.status.starts_with("enabled") {
                let conformant = match upstream_transport {
                    Transport::Webhook => sub.session_id.is_none(),
                    Transport::Websocket => {
                        sub.session_id.as_deref() == session_snapshot.as_deref()
                    }
                };
                if conformant {
                    return EnsureOutcome::Done;
                }
            }
        }

        // Rotate: delete whatever upstream object the local row points to.
        if let Some(sub) = &existing {
            let mut delete_token: Option<String> = None;
            if upstream_transport == Transport::Websocket {
                if let Ok(Some(bot)) = repo::bots::get(&self.pool, key.bot_id).await {
                    if bot.enabled {
                        delete_token =
                            ensure_bot_access_token(&self.pool, &self.twitch, &bot).await.ok();
                    }
                }
            }
            if let Err(err) = self
                .twitch
                .delete_eventsub_subscription(&sub.twitch_subscription_id, delete_token.as_deref())
                .await
            {
                if !err.is_subscription_not_found() {
                    let reason = format!(
                        "Cannot rotate EventSub subscription {}: {err}",
                        sub.twitch_subscription_id
                    );
                    warn!(key = %key, error = %err, "cannot rotate subscription");
                    self.notify_subscription_failure(key, upstream_transport, &reason).await;
                    return EnsureOutcome::Fail(reason);
                }
            }
            if let Err(err) = repo::subscriptions::delete_by_key(&self.pool, key).await {
                return EnsureOutcome::Fail(format!("subscription row delete failed: {err}"));
            }
        }

        // Build the transport descriptor.
        let transport_value = match upstream_transport {
            Transport::Webhook => {
                let (Some(callback), Some(secret)) = (
                    self.settings.twitch_eventsub_webhook_callback_url.clone(),
                    self.settings.twitch_eventsub_webhook_secret.clone(),
                ) else {
                    let reason = "TWITCH_EVENTSUB_WEBHOOK_CALLBACK_URL and \
                         TWITCH_EVENTSUB_WEBHOOK_SECRET are required for webhook events"
                        .to_owned();
                    self.notify_subscription_failure(key, upstream_transport, &reason).await;
                    return EnsureOutcome::Fail(reason);
                };
                json!({"method": "webhook", "callback": callback, "secret": secret})
            }
            Transport::Websocket => {
                let Some(session_id) = session_snapshot.clone() else {
                    return EnsureOutcome::Skip;
                };
                if self.current_session().as_deref() != Some(session_id.as_str()) {
                    info!(key = %key, "skipping websocket subscription create due to session change");
                    return EnsureOutcome::Skip;
                }
                json!({"method": "websocket", "session_id": session_id})
            }
        };

        // The bot must exist, be enabled, and (for websocket) have a token.
        let bot = match repo::bots::get(&self.pool, key.bot_id).await {
            Ok(Some(bot)) => bot,
            Ok(None) => {
                let reason = format!("Bot account missing for subscription: {}", key.bot_id);
                self.notify_subscription_failure(key, upstream_transport, &reason).await;
                return EnsureOutcome::Fail(reason);
            }
            Err(err) => return EnsureOutcome::Fail(format!("bot lookup failed: {err}")),
        };
        if !bot.enabled {
            let reason = format!("Bot account disabled for subscription: {}", key.bot_id);
            self.notify_subscription_failure(key, upstream_transport, &reason).await;
            return EnsureOutcome::Fail(reason);
        }
        let mut create_token: Option<String> = None;
        if upstream_transport == Transport::Websocket {
            match ensure_bot_access_token(&self.pool, &self.twitch, &bot).await {
                Ok(token) => create_token = Some(token),
                Err(err) => {
                    let reason = format!("bot token refresh failed: {err}");
                    self.notify_subscription_failure(key, upstream_transport, &reason).await;
                    return EnsureOutcome::Fail(reason);
                }
            }
        }

        let mut condition = json!({"broadcaster_user_id": key.broadcaster_user_id});
        if catalog::requires_condition_user_id(&key.event_type) {
            condition["user_id"] = json!(bot.twitch_user_id);
        }

        // Scope precondition.
        let groups = catalog::required_scope_groups(&key.event_type);
        if !groups.is_empty() {
            if key.broadcaster_user_id == bot.twitch_user_id {
                let token_for_check = match &create_token {
                    Some(token) => token.clone(),
                    None => match ensure_bot_access_token(&self.pool, &self.twitch, &bot).await {
                        Ok(token) => token,
                        Err(err) => {
                            let reason = format!("bot token refresh failed: {err}");
                            self.notify_subscription_failure(key, upstream_transport, &reason)
                                .await;
                            return EnsureOutcome::Fail(reason);
                        }
                    },
                };
                let token_info = match self.twitch.validate_user_token(&token_for_check).await {
                    Ok(info) => info,
                    Err(err) => {
                        let reason = format!("bot token validation failed: {err}");
                        self.notify_subscription_failure(key, upstream_transport, &reason).await;
                        return EnsureOutcome::Fail(reason);
                    }
                };
                if !catalog::scopes_satisfy_groups(&token_info.scopes, groups) {
                    let missing = catalog::describe_scope_groups(groups);
                    let reason = format!(
                        "subscription missing proper authorization: \
                         bot token is missing required scope(s) ({missing})"
                    );
                    self.notify_subscription_failure(key, upstream_transport, &reason).await;
                    return EnsureOutcome::Fail(reason);
                }
            } else {
                let grant_rows = repo::grants::list_for_bot_broadcaster(
                    &self.pool,
                    key.bot_id,
                    &key.broadcaster_user_id,
                )
                .await
                .unwrap_or_default();
                let authorized = grant_rows
                    .iter()
                    .any(|row| catalog::scopes_satisfy_groups(&row.scopes(), groups));
                if !authorized {
                    let missing = catalog::describe_scope_groups(groups);
                    let reason = format!(
                        "subscription missing proper authorization: \
                         broadcaster grant is missing required scope(s) ({missing})"
                    );
                    self.notify_subscription_failure(key, upstream_transport, &reason).await;
                    return EnsureOutcome::Fail(reason);
                }
            }
        }

        match self
            .twitch
            .create_eventsub_subscription(
                &key.event_type,
                &version,
                &condition,
                &transport_value,
                create_token.as_deref(),
            )
            .await
        {
            Ok(created) => {
                let twitch_subscription_id =
                    created.get("id").and_then(Value::as_str).unwrap_or_default().to_owned();
                let status = created
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("enabled")
                    .to_owned();
                let session_id = created
                    .get("transport")
                    .and_then(|t| t.get("session_id"))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                if let Err(err) = repo::subscriptions::upsert_for_key(
                    &self.pool,
                    key,
                    &twitch_subscription_id,
                    &status,
                    session_id.as_deref(),
                )
                .await
                {
                    return EnsureOutcome::Fail(format!("subscription row upsert failed: {err}"));
                }
                EnsureOutcome::Done
            }
            Err(err) => {
                if upstream_transport == Transport::Websocket && err.is_stale_websocket_session() {
                    info!(
                        session = session_snapshot.as_deref().unwrap_or(""),
                        "websocket session became stale during create; will retry on next welcome"
                    );
                    if let Some(snapshot) = &session_snapshot {
                        self.clear_session_if(snapshot);
                    }
                    return EnsureOutcome::Skip;
                }
                let reason = err.to_string();
                self.notify_subscription_failure(key, upstream_transport, &reason).await;
                EnsureOutcome::Fail(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_scope_failures_map_to_missing_scope() {
        let (code, _) = classify_subscription_failure(
            "subscription missing proper authorization: broadcaster grant is missing required scope(s) (channel:manage:polls|channel:read:polls)",
        );
        assert_eq!(code, "missing_scope");
        assert!(failure_is_pending_authorization(
            "broadcaster grant is missing required scope(s) (channel:read:polls)"
        ));
    }

    #[test]
    fn bare_authorization_failures_map_to_insufficient_permissions() {
        let (code, hint) =
            classify_subscription_failure("subscription missing proper authorization");
        assert_eq!(code, "insufficient_permissions");
        assert!(hint.contains("Broadcaster authorization"));
        assert!(failure_is_pending_authorization("subscription missing proper authorization"));
    }

    #[test]
    fn scope_failures_map_to_missing_scope() {
        let (code, _) = classify_subscription_failure("token lacks scope channel:read:polls");
        assert_eq!(code, "missing_scope");
    }

    #[test]
    fn unauthorized_maps_to_unauthorized() {
        let (code, _) = classify_subscription_failure("Twitch API error (401): unauthorized");
        assert_eq!(code, "unauthorized");
    }

    #[test]
    fn everything_else_is_create_failed() {
        let (code, _) = classify_subscription_failure("Twitch API error (500): boom");
        assert_eq!(code, "subscription_create_failed");
    }
}
