//! Notification pipeline: the single entry point for upstream events from
//! both transports, plus the synthetic `subscription.error` /
//! `interest.rejected` fan-outs.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use es_protocol::{
    EventEnvelope, InterestRejectedEvent, NotificationPayload, SubscriptionErrorEvent,
    PROVIDER_BRIDGE, TYPE_INTEREST_REJECTED, TYPE_SUBSCRIPTION_ERROR,
};
use futures_util::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::ensure::classify_subscription_failure;
use super::EventSubManager;
use crate::catalog::Transport;
use crate::hub::EventHub;
use crate::registry::InterestKey;
use crate::repo;
use crate::repo::interests::InterestRow;

/// Which upstream transport carried a notification into the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingTransport {
    Websocket,
    Webhook,
}

impl IncomingTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            IncomingTransport::Websocket => "twitch_websocket",
            IncomingTransport::Webhook => "twitch_webhook",
        }
    }
}

const WS_TARGET: &str = "/ws/events";
const UPSTREAM_TARGET: &str = "twitch:eventsub";

fn parse_event_datetime(raw: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw?).ok().map(|dt| dt.with_timezone(&Utc))
}

fn interest_target(interest: &InterestRow) -> String {
    if interest.transport == "webhook" {
        interest.webhook_url.clone().unwrap_or_else(|| WS_TARGET.to_owned())
    } else {
        WS_TARGET.to_owned()
    }
}

impl EventSubManager {
    /// Process one upstream notification. Deliveries for this notification
    /// complete before the call returns, which is what keeps per-consumer
    /// envelope ordering aligned with arrival order on the WS path.
    pub async fn handle_notification(
        &self,
        payload: &NotificationPayload,
        message_id: &str,
        incoming_transport: IncomingTransport,
    ) {
        let event_type = payload.subscription.event_type.trim().to_owned();
        if event_type == "user.authorization.revoke" {
            self.handle_authorization_revoke(&payload.event).await;
            return;
        }
        let broadcaster_user_id = payload
            .event
            .get("broadcaster_user_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| payload.subscription.condition.broadcaster_user_id.clone());
        let (Some(broadcaster_user_id), false) = (broadcaster_user_id, event_type.is_empty())
        else {
            return;
        };

        let Some(bot) = self.resolve_notification_bot(payload, &broadcaster_user_id).await else {
            return;
        };
        let key = InterestKey {
            bot_id: bot.id,
            event_type: event_type.clone(),
            broadcaster_user_id: broadcaster_user_id.clone(),
        };
        let interests = self.fanout_interests(&key).await;

        if !interests.is_empty() {
            let source_payload = json!({
                "message_id": message_id,
                "subscription": payload.subscription,
                "event": payload.event,
            });
            let distinct_consumers: HashSet<Uuid> =
                interests.iter().map(|i| i.consumer_id).collect();
            self.audit(
                "info",
                json!({
                    "kind": "eventsub_incoming",
                    "bot_id": bot.id.to_string(),
                    "event_type": event_type,
                    "broadcaster_user_id": broadcaster_user_id,
                    "message_id": message_id,
                    "direction": "incoming",
                    "transport": incoming_transport.as_str(),
                    "matched_consumers": distinct_consumers.len(),
                    "payload": source_payload,
                }),
            )
            .await;
            join_all(distinct_consumers.iter().map(|consumer_id| {
                self.record_trace(
                    *consumer_id,
                    "incoming",
                    incoming_transport.as_str(),
                    &event_type,
                    Some(UPSTREAM_TARGET),
                    &source_payload,
                )
            }))
            .await;
        }

        let mut envelope = EventHub::envelope(message_id, &event_type, payload.event.clone());
        if event_type.starts_with("channel.chat.") {
            // Optional enrichment; consumers ignore unknown keys.
            envelope.twitch_chat_assets =
                self.chat_assets.enrich_chat_event(&broadcaster_user_id, &payload.event).await;
        }

        self.update_channel_state_from_event(
            bot.id,
            &event_type,
            &broadcaster_user_id,
            &payload.event,
        )
        .await;

        join_all(interests.iter().map(|interest| {
            let audit_payload = json!({
                "kind": "eventsub_outgoing",
                "consumer_id": interest.consumer_id.to_string(),
                "bot_id": bot.id.to_string(),
                "event_type": event_type,
                "broadcaster_user_id": broadcaster_user_id,
                "direction": "outgoing",
                "transport": interest.transport,
                "target": interest_target(interest),
                "payload": envelope,
            });
            self.deliver_envelope_to_interest(interest, &envelope, &event_type, "info", audit_payload)
        }))
        .await;
    }

    /// Interests matching `key` whose consumer is currently enabled; a
    /// disabled consumer is treated as absent for fan-out.
    async fn fanout_interests(&self, key: &InterestKey) -> Vec<InterestRow> {
        let mut interests = self.registry.interested(key);
        if interests.is_empty() {
            return interests;
        }
        let consumer_ids: Vec<Uuid> = interests.iter().map(|i| i.consumer_id).collect();
        match repo::consumers::enabled_ids(&self.pool, &consumer_ids).await {
            Ok(enabled) => interests.retain(|i| enabled.contains(&i.consumer_id)),
            Err(err) => {
                warn!(error = %err, "failed filtering disabled consumers; delivering to all")
            }
        }
        interests
    }

    /// Prefer the bot recorded on the local subscription row; fall back to
    /// the chat condition user id, then to a bot whose Twitch identity is
    /// the broadcaster.
    async fn resolve_notification_bot(
        &self,
        payload: &NotificationPayload,
        broadcaster_user_id: &str,
    ) -> Option<repo::bots::BotRow> {
        let subscription_id = payload.subscription.id.trim();
        if !subscription_id.is_empty() {
            if let Ok(Some(sub)) =
                repo::subscriptions::get_by_twitch_id(&self.pool, subscription_id).await
            {
                if let Ok(Some(bot)) = repo::bots::get(&self.pool, sub.bot_id).await {
                    return Some(bot);
                }
            }
        }
        let lookup_user_id = if payload.subscription.event_type.starts_with("channel.chat.") {
            payload.subscription.condition.user_id.clone()?
        } else {
            broadcaster_user_id.to_owned()
        };
        repo::bots::get_by_twitch_user_id(&self.pool, &lookup_user_id).await.ok().flatten()
    }

    /// One bounded-concurrency delivery plus its audit record and trace.
    pub(crate) async fn deliver_envelope_to_interest(
        &self,
        interest: &InterestRow,
        envelope: &EventEnvelope,
        event_type: &str,
        audit_level: &str,
        audit_payload: Value,
    ) {
        let _permit = self.fanout.acquire().await.expect("fanout semaphore closed");
        if interest.transport == "webhook" {
            if let Some(url) = &interest.webhook_url {
                if let Err(err) = self
                    .hub
                    .publish_webhook(
                        interest.consumer_id,
                        url,
                        envelope,
                        self.settings.tunables.webhook_delivery_timeout,
                    )
                    .await
                {
                    debug!(consumer_id = %interest.consumer_id, error = %err,
                        "webhook delivery failed");
                }
            }
        } else {
            self.hub.publish_ws(interest.consumer_id, envelope).await;
        }
        let target = interest_target(interest);
        self.audit(audit_level, audit_payload).await;
        self.record_trace(
            interest.consumer_id,
            "outgoing",
            &interest.transport,
            event_type,
            Some(&target),
            &serde_json::to_value(envelope).unwrap_or(Value::Null),
        )
        .await;
    }

    /// Tell every interested consumer a subscription could not be ensured.
    /// Throttled per (consumer, key, error code).
    pub(crate) async fn notify_subscription_failure(
        &self,
        key: &InterestKey,
        upstream_transport: Transport,
        reason: &str,
    ) {
        let interests = self.registry.interested(key);
        if interests.is_empty() {
            return;
        }
        let (error_code, hint) = classify_subscription_failure(reason);
        let mut deliveries = Vec::new();
        for interest in &interests {
            if !self.should_emit_subscription_error(interest.consumer_id, key, error_code) {
                continue;
            }
            let event = SubscriptionErrorEvent {
                error_code: error_code.to_owned(),
                reason: reason.to_owned(),
                hint: hint.to_owned(),
                event_type: key.event_type.clone(),
                broadcaster_user_id: key.broadcaster_user_id.clone(),
                bot_account_id: key.bot_id,
                upstream_transport: upstream_transport.as_str().to_owned(),
            };
            let envelope = EventEnvelope {
                id: Uuid::new_v4().simple().to_string(),
                provider: PROVIDER_BRIDGE.to_owned(),
                event_type: TYPE_SUBSCRIPTION_ERROR.to_owned(),
                event_timestamp: Utc::now(),
                event: serde_json::to_value(&event).unwrap_or(Value::Null),
                twitch_chat_assets: None,
            };
            let audit_payload = json!({
                "kind": "eventsub_subscription_error",
                "consumer_id": interest.consumer_id.to_string(),
                "bot_id": key.bot_id.to_string(),
                "event_type": key.event_type,
                "broadcaster_user_id": key.broadcaster_user_id,
                "direction": "outgoing",
                "transport": interest.transport,
                "target": interest_target(interest),
                "error_code": error_code,
                "reason": reason,
            });
            deliveries.push((interest.clone(), envelope, audit_payload));
        }
        join_all(deliveries.iter().map(|(interest, envelope, audit_payload)| {
            self.deliver_envelope_to_interest(
                interest,
                envelope,
                TYPE_SUBSCRIPTION_ERROR,
                "error",
                audit_payload.clone(),
            )
        }))
        .await;
    }

    /// Send `interest.rejected` to every holder of `key`, then delete those
    /// interests and tear down the subscription if nothing else needs it.
    pub async fn reject_interests_for_key(
        &self,
        key: &InterestKey,
        reason: &str,
        upstream_transport: Option<Transport>,
    ) -> usize {
        let interests = self.registry.interested(key);
        if interests.is_empty() {
            return 0;
        }
        let transport =
            upstream_transport.unwrap_or_else(|| self.transport_for_event(&key.event_type));
        join_all(interests.iter().map(|interest| {
            let event = InterestRejectedEvent {
                interest_id: interest.id,
                consumer_id: interest.consumer_id,
                bot_account_id: key.bot_id,
                event_type: key.event_type.clone(),
                broadcaster_user_id: key.broadcaster_user_id.clone(),
                upstream_transport: transport.as_str().to_owned(),
                reason: reason.to_owned(),
            };
            let envelope = EventEnvelope {
                id: Uuid::new_v4().simple().to_string(),
                provider: PROVIDER_BRIDGE.to_owned(),
                event_type: TYPE_INTEREST_REJECTED.to_owned(),
                event_timestamp: Utc::now(),
                event: serde_json::to_value(&event).unwrap_or(Value::Null),
                twitch_chat_assets: None,
            };
            let audit_payload = json!({
                "kind": "interest_rejected",
                "consumer_id": interest.consumer_id.to_string(),
                "bot_id": key.bot_id.to_string(),
                "event_type": key.event_type,
                "broadcaster_user_id": key.broadcaster_user_id,
                "direction": "outgoing",
                "transport": interest.transport,
                "target": interest_target(interest),
                "reason": reason,
            });
            async move {
                self.deliver_envelope_to_interest(
                    interest,
                    &envelope,
                    TYPE_INTEREST_REJECTED,
                    "warning",
                    audit_payload,
                )
                .await;
            }
        }))
        .await;

        let ids: Vec<Uuid> = interests.iter().map(|i| i.id).collect();
        if let Err(err) = repo::interests::delete_by_ids(&self.pool, &ids).await {
            warn!(key = %key, error = %err, "failed deleting rejected interests");
        }
        for interest in &interests {
            let (removed_key, still_used) = self.registry.remove(interest);
            self.on_interest_removed(&removed_key, still_used).await;
        }
        interests.len()
    }

    /// Upstream told us one subscription is gone; keep the row, mark it.
    pub async fn handle_revocation(&self, payload: &NotificationPayload) {
        let twitch_id = payload.subscription.id.trim();
        if twitch_id.is_empty() {
            return;
        }
        self.audit(
            "warning",
            json!({
                "kind": "eventsub_revocation",
                "direction": "incoming",
                "transport": "twitch_eventsub",
                "subscription_id": twitch_id,
                "payload": payload,
            }),
        )
        .await;
        match repo::subscriptions::mark_revoked(&self.pool, twitch_id).await {
            Ok(true) => warn!(subscription_id = twitch_id, "upstream subscription revoked"),
            Ok(false) => debug!(subscription_id = twitch_id, "revocation for unknown subscription"),
            Err(err) => warn!(error = %err, "failed marking subscription revoked"),
        }
    }

    /// `user.authorization.revoke`: the bot's grant is gone. Disable it and
    /// drop its tokens; its subscriptions die with the next reconcile.
    async fn handle_authorization_revoke(&self, event: &Value) {
        let Some(revoked_user_id) = event.get("user_id").and_then(Value::as_str) else {
            return;
        };
        self.audit(
            "warning",
            json!({
                "kind": "eventsub_user_authorization_revoke",
                "direction": "incoming",
                "transport": "twitch_eventsub",
                "event_type": "user.authorization.revoke",
                "payload": event,
            }),
        )
        .await;
        match repo::bots::disable_and_clear_tokens(&self.pool, revoked_user_id).await {
            Ok(true) => {
                warn!(twitch_user_id = revoked_user_id, "disabled bot after authorization revoke");
            }
            Ok(false) => {
                debug!(twitch_user_id = revoked_user_id, "authorization revoke for unknown bot");
            }
            Err(err) => warn!(error = %err, "failed disabling bot after authorization revoke"),
        }
    }

    async fn update_channel_state_from_event(
        &self,
        bot_id: Uuid,
        event_type: &str,
        broadcaster_user_id: &str,
        event: &Value,
    ) {
        let is_live = match event_type {
            "stream.online" => true,
            "stream.offline" => false,
            _ => return,
        };
        let started_at = if is_live {
            parse_event_datetime(event.get("started_at").and_then(Value::as_str))
        } else {
            None
        };
        if let Err(err) = repo::channel_states::apply_stream_event(
            &self.pool,
            bot_id,
            broadcaster_user_id,
            is_live,
            started_at,
        )
        .await
        {
            warn!(error = %err, "failed applying stream event to channel state");
        }
    }

    // -----------------------------------------------------------------------
    // Channel liveness refresh (Helix poll)
    // -----------------------------------------------------------------------

    async fn refresh_stream_states_for_bot_targets(
        &self,
        per_bot: HashMap<Uuid, HashSet<String>>,
    ) {
        if per_bot.is_empty() {
            return;
        }
        // Liveness should reflect real Twitch state even when bot tokens are
        // stale, so the poll runs on the app token.
        let token = match self.twitch.app_access_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, "failed acquiring app token for stream refresh");
                return;
            }
        };
        for (bot_id, broadcaster_ids) in per_bot {
            if broadcaster_ids.is_empty() {
                continue;
            }
            let broadcaster_list: Vec<String> = broadcaster_ids.iter().cloned().collect();
            let mut live_streams: Vec<Value> = Vec::new();
            let mut failed = false;
            for chunk in broadcaster_list.chunks(100) {
                match self.twitch.get_streams_by_user_ids(&token, chunk).await {
                    Ok(streams) => live_streams.extend(streams),
                    Err(err) => {
                        warn!(%bot_id, error = %err, "failed refreshing stream states");
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                continue;
            }
            let live_by_user: HashMap<&str, &Value> = live_streams
                .iter()
                .filter_map(|s| s.get("user_id").and_then(Value::as_str).map(|id| (id, s)))
                .collect();
            for broadcaster_id in &broadcaster_ids {
                let live = live_by_user.get(broadcaster_id.as_str()).map(|stream| {
                    (
                        stream.get("title").and_then(Value::as_str).map(str::to_owned),
                        stream.get("game_name").and_then(Value::as_str).map(str::to_owned),
                        parse_event_datetime(stream.get("started_at").and_then(Value::as_str)),
                    )
                });
                if let Err(err) = repo::channel_states::apply_helix_poll(
                    &self.pool,
                    bot_id,
                    broadcaster_id,
                    live,
                )
                .await
                {
                    warn!(error = %err, "failed writing channel state from Helix poll");
                }
            }
        }
    }

    pub(crate) async fn refresh_stream_states_for_active_subscriptions(&self) {
        let subs = match repo::subscriptions::list_stream_state(&self.pool).await {
            Ok(subs) => subs,
            Err(err) => {
                warn!(error = %err, "failed listing stream-state subscriptions");
                return;
            }
        };
        let mut per_bot: HashMap<Uuid, HashSet<String>> = HashMap::new();
        for sub in subs {
            per_bot.entry(sub.bot_id).or_default().insert(sub.broadcaster_user_id);
        }
        if per_bot.is_empty() {
            debug!("no stream.online/stream.offline subscriptions; skipping Helix refresh");
            return;
        }
        self.refresh_stream_states_for_bot_targets(per_bot).await;
    }

    pub(crate) async fn refresh_stream_states_for_interested_channels(&self) {
        let mut per_bot: HashMap<Uuid, HashSet<String>> = HashMap::new();
        for key in self.registry.keys() {
            if key.event_type == "user.authorization.revoke" {
                continue;
            }
            per_bot.entry(key.bot_id).or_default().insert(key.broadcaster_user_id);
        }
        self.refresh_stream_states_for_bot_targets(per_bot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_transport_labels() {
        assert_eq!(IncomingTransport::Websocket.as_str(), "twitch_websocket");
        assert_eq!(IncomingTransport::Webhook.as_str(), "twitch_webhook");
    }

    #[test]
    fn event_datetime_parses_rfc3339() {
        let parsed = parse_event_datetime(Some("2026-02-17T00:00:00Z")).expect("parse");
        assert_eq!(parsed.to_rfc3339(), "2026-02-17T00:00:00+00:00");
        assert!(parse_event_datetime(Some("not-a-date")).is_none());
        assert!(parse_event_datetime(None).is_none());
    }

    #[test]
    fn webhook_interests_target_their_url() {
        let mut interest = crate::repo::interests::InterestRow {
            id: Uuid::new_v4(),
            consumer_id: Uuid::new_v4(),
            bot_id: Uuid::new_v4(),
            event_type: "stream.online".to_owned(),
            broadcaster_user_id: "222".to_owned(),
            transport: "webhook".to_owned(),
            webhook_url: Some("https://svc.example.com/hook".to_owned()),
            last_heartbeat_at: None,
            stale_marked_at: None,
            delete_after: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(interest_target(&interest), "https://svc.example.com/hook");
        interest.transport = "websocket".to_owned();
        assert_eq!(interest_target(&interest), WS_TARGET);
    }
}
