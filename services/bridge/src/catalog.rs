//! Static EventSub subscription-type catalog.
//!
//! Pure data and pure functions; no state, no I/O. The table is a snapshot of
//! the upstream subscription-type list and drives transport choice, preferred
//! versions, condition shape, and scope preconditions everywhere else.

use serde::Serialize;

// Snapshot of https://dev.twitch.tv/docs/eventsub/eventsub-subscription-types/
pub const SOURCE_URL: &str = "https://dev.twitch.tv/docs/eventsub/eventsub-subscription-types/";
pub const SOURCE_SNAPSHOT_DATE: &str = "2026-02-17";

/// Upstream delivery transport for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Websocket,
    Webhook,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Websocket => "websocket",
            Transport::Webhook => "webhook",
        }
    }

    pub fn parse(raw: &str) -> Option<Transport> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "websocket" => Some(Transport::Websocket),
            "webhook" => Some(Transport::Webhook),
            _ => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Stable,
    New,
    Beta,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CatalogEntry {
    pub title: &'static str,
    pub event_type: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub status: EntryStatus,
}

const fn stable(
    title: &'static str,
    event_type: &'static str,
    version: &'static str,
    description: &'static str,
) -> CatalogEntry {
    CatalogEntry { title, event_type, version, description, status: EntryStatus::Stable }
}

const fn new(
    title: &'static str,
    event_type: &'static str,
    version: &'static str,
    description: &'static str,
) -> CatalogEntry {
    CatalogEntry { title, event_type, version, description, status: EntryStatus::New }
}

const fn beta(
    title: &'static str,
    event_type: &'static str,
    description: &'static str,
) -> CatalogEntry {
    CatalogEntry { title, event_type, version: "beta", description, status: EntryStatus::Beta }
}

pub const CATALOG: &[CatalogEntry] = &[
    stable("Automod Message Hold", "automod.message.hold", "1", "Message caught by AutoMod."),
    new(
        "Automod Message Hold V2",
        "automod.message.hold",
        "2",
        "Message caught by AutoMod (public blocked terms only).",
    ),
    stable(
        "Automod Message Update",
        "automod.message.update",
        "1",
        "AutoMod queue message status changed.",
    ),
    new(
        "Automod Message Update V2",
        "automod.message.update",
        "2",
        "AutoMod queue message status changed (public blocked terms only).",
    ),
    stable(
        "Automod Settings Update",
        "automod.settings.update",
        "1",
        "Broadcaster AutoMod settings updated.",
    ),
    stable("Automod Terms Update", "automod.terms.update", "1", "Broadcaster AutoMod terms updated."),
    new("Channel Bits Use", "channel.bits.use", "1", "Bits used on channel."),
    stable("Channel Update", "channel.update", "2", "Channel metadata updated."),
    stable("Channel Follow", "channel.follow", "2", "User followed channel."),
    stable("Channel Ad Break Begin", "channel.ad_break.begin", "1", "Ad break started."),
    stable("Channel Chat Clear", "channel.chat.clear", "1", "Chat room messages cleared."),
    stable(
        "Channel Chat Clear User Messages",
        "channel.chat.clear_user_messages",
        "1",
        "Specific user chat messages cleared.",
    ),
    new("Channel Chat Message", "channel.chat.message", "1", "Chat message sent."),
    stable(
        "Channel Chat Message Delete",
        "channel.chat.message_delete",
        "1",
        "Specific chat message deleted.",
    ),
    stable(
        "Channel Chat Notification",
        "channel.chat.notification",
        "1",
        "Chat UI notification event occurred.",
    ),
    new("Channel Chat Settings Update", "channel.chat_settings.update", "1", "Chat settings updated."),
    new(
        "Channel Chat User Message Hold",
        "channel.chat.user_message_hold",
        "1",
        "User message held by AutoMod.",
    ),
    new(
        "Channel Chat User Message Update",
        "channel.chat.user_message_update",
        "1",
        "Held user message moderation state changed.",
    ),
    new(
        "Channel Shared Chat Session Begin",
        "channel.shared_chat.begin",
        "1",
        "Channel joined a shared chat session.",
    ),
    new(
        "Channel Shared Chat Session Update",
        "channel.shared_chat.update",
        "1",
        "Shared chat session changed.",
    ),
    stable(
        "Channel Shared Chat Session End",
        "channel.shared_chat.end",
        "1",
        "Channel left shared chat session.",
    ),
    stable("Channel Subscribe", "channel.subscribe", "1", "New subscription."),
    stable("Channel Subscription End", "channel.subscription.end", "1", "Subscription ended."),
    stable("Channel Subscription Gift", "channel.subscription.gift", "1", "Gift subscription sent."),
    stable(
        "Channel Subscription Message",
        "channel.subscription.message",
        "1",
        "Resubscription chat message.",
    ),
    stable("Channel Cheer", "channel.cheer", "1", "Bits cheer event."),
    stable("Channel Raid", "channel.raid", "1", "Channel raid event."),
    stable("Channel Ban", "channel.ban", "1", "User banned."),
    stable("Channel Unban", "channel.unban", "1", "User unbanned."),
    new("Channel Unban Request Create", "channel.unban_request.create", "1", "Unban request created."),
    new(
        "Channel Unban Request Resolve",
        "channel.unban_request.resolve",
        "1",
        "Unban request resolved.",
    ),
    stable("Channel Moderate", "channel.moderate", "1", "Moderation action."),
    new("Channel Moderate V2", "channel.moderate", "2", "Moderation action (includes warnings)."),
    stable("Channel Moderator Add", "channel.moderator.add", "1", "Moderator added."),
    stable("Channel Moderator Remove", "channel.moderator.remove", "1", "Moderator removed."),
    beta("Channel Guest Star Session Begin", "channel.guest_star_session.begin", "Guest Star session started."),
    beta("Channel Guest Star Session End", "channel.guest_star_session.end", "Guest Star session ended."),
    beta("Channel Guest Star Guest Update", "channel.guest_star_guest.update", "Guest Star guest/slot updated."),
    beta(
        "Channel Guest Star Settings Update",
        "channel.guest_star_settings.update",
        "Guest Star settings updated.",
    ),
    stable(
        "Channel Points Automatic Reward Redemption Add",
        "channel.channel_points_automatic_reward_redemption.add",
        "1",
        "Automatic reward redeemed.",
    ),
    new(
        "Channel Points Automatic Reward Redemption Add V2",
        "channel.channel_points_automatic_reward_redemption.add",
        "2",
        "Automatic reward redeemed.",
    ),
    stable(
        "Channel Points Custom Reward Add",
        "channel.channel_points_custom_reward.add",
        "1",
        "Custom reward created.",
    ),
    stable(
        "Channel Points Custom Reward Update",
        "channel.channel_points_custom_reward.update",
        "1",
        "Custom reward updated.",
    ),
    stable(
        "Channel Points Custom Reward Remove",
        "channel.channel_points_custom_reward.remove",
        "1",
        "Custom reward removed.",
    ),
    stable(
        "Channel Points Custom Reward Redemption Add",
        "channel.channel_points_custom_reward_redemption.add",
        "1",
        "Custom reward redeemed.",
    ),
    stable(
        "Channel Points Custom Reward Redemption Update",
        "channel.channel_points_custom_reward_redemption.update",
        "1",
        "Custom reward redemption updated.",
    ),
    stable("Channel Poll Begin", "channel.poll.begin", "1", "Poll started."),
    stable("Channel Poll Progress", "channel.poll.progress", "1", "Poll vote update."),
    stable("Channel Poll End", "channel.poll.end", "1", "Poll ended."),
    stable("Channel Prediction Begin", "channel.prediction.begin", "1", "Prediction started."),
    stable("Channel Prediction Progress", "channel.prediction.progress", "1", "Prediction vote update."),
    stable("Channel Prediction Lock", "channel.prediction.lock", "1", "Prediction locked."),
    stable("Channel Prediction End", "channel.prediction.end", "1", "Prediction ended."),
    new(
        "Channel Suspicious User Message",
        "channel.suspicious_user.message",
        "1",
        "Suspicious user message sent.",
    ),
    new(
        "Channel Suspicious User Update",
        "channel.suspicious_user.update",
        "1",
        "Suspicious user state updated.",
    ),
    new("Channel VIP Add", "channel.vip.add", "1", "VIP added."),
    new("Channel VIP Remove", "channel.vip.remove", "1", "VIP removed."),
    new("Channel Warning Acknowledge", "channel.warning.acknowledge", "1", "Warning acknowledged."),
    new("Channel Warning Send", "channel.warning.send", "1", "Warning sent."),
    stable("Charity Donation", "channel.charity_campaign.donate", "1", "Charity donation made."),
    stable("Charity Campaign Start", "channel.charity_campaign.start", "1", "Charity campaign started."),
    stable(
        "Charity Campaign Progress",
        "channel.charity_campaign.progress",
        "1",
        "Charity campaign progress update.",
    ),
    stable("Charity Campaign Stop", "channel.charity_campaign.stop", "1", "Charity campaign stopped."),
    new("Conduit Shard Disabled", "conduit.shard.disabled", "1", "Conduit shard disabled."),
    stable("Drop Entitlement Grant", "drop.entitlement.grant", "1", "Drop entitlement granted."),
    stable(
        "Extension Bits Transaction Create",
        "extension.bits_transaction.create",
        "1",
        "Extension Bits transaction.",
    ),
    stable("Goal Begin", "channel.goal.begin", "1", "Goal started."),
    stable("Goal Progress", "channel.goal.progress", "1", "Goal progress update."),
    stable("Goal End", "channel.goal.end", "1", "Goal ended."),
    stable("Hype Train Begin", "channel.hype_train.begin", "2", "Hype Train started."),
    stable("Hype Train Progress", "channel.hype_train.progress", "2", "Hype Train progress."),
    stable("Hype Train End", "channel.hype_train.end", "2", "Hype Train ended."),
    stable("Shield Mode Begin", "channel.shield_mode.begin", "1", "Shield Mode enabled."),
    stable("Shield Mode End", "channel.shield_mode.end", "1", "Shield Mode disabled."),
    stable("Shoutout Create", "channel.shoutout.create", "1", "Shoutout sent."),
    stable("Shoutout Receive", "channel.shoutout.receive", "1", "Shoutout received."),
    stable("Stream Online", "stream.online", "1", "Stream started."),
    stable("Stream Offline", "stream.offline", "1", "Stream stopped."),
    stable("User Authorization Grant", "user.authorization.grant", "1", "User authorized client ID."),
    stable(
        "User Authorization Revoke",
        "user.authorization.revoke",
        "1",
        "User revoked client ID authorization.",
    ),
    stable("User Update", "user.update", "1", "User account updated."),
    new("Whisper Received", "user.whisper.message", "1", "User received whisper."),
];

/// Event types Twitch only delivers over webhook.
const WEBSOCKET_UNSUPPORTED: &[&str] = &[
    "drop.entitlement.grant",
    "extension.bits_transaction.create",
    "user.authorization.grant",
    "user.authorization.revoke",
];

pub fn is_known_event_type(event_type: &str) -> bool {
    let normalized = event_type.trim().to_ascii_lowercase();
    CATALOG.iter().any(|entry| entry.event_type == normalized)
}

pub fn supported_upstream_transports(event_type: &str) -> &'static [Transport] {
    let normalized = event_type.trim().to_ascii_lowercase();
    if WEBSOCKET_UNSUPPORTED.contains(&normalized.as_str()) {
        &[Transport::Webhook]
    } else {
        &[Transport::Webhook, Transport::Websocket]
    }
}

/// Pick the upstream transport the bridge would use for `event_type` right
/// now, with a human-readable reason.
pub fn best_transport(event_type: &str, webhook_available: bool) -> (Transport, &'static str) {
    let normalized = event_type.trim().to_ascii_lowercase();
    if normalized == "user.authorization.revoke" {
        return (
            Transport::Webhook,
            "Webhook-only by Twitch; required for authorization revoke handling.",
        );
    }
    let transports = supported_upstream_transports(&normalized);
    if webhook_available && transports.contains(&Transport::Webhook) {
        return (
            Transport::Webhook,
            "Webhook preferred for hosted services; app-token EventSub flow and durable delivery.",
        );
    }
    if transports.contains(&Transport::Websocket) {
        return (Transport::Websocket, "Webhook callback not configured; using websocket fallback.");
    }
    (Transport::Webhook, "Webhook-only by Twitch.")
}

/// Highest numeric stable version in the catalog, defaulting to "1".
pub fn preferred_version(event_type: &str) -> String {
    let normalized = event_type.trim().to_ascii_lowercase();
    CATALOG
        .iter()
        .filter(|entry| entry.event_type == normalized)
        .filter_map(|entry| entry.version.parse::<u32>().ok())
        .max()
        .unwrap_or(1)
        .to_string()
}

/// Whether the subscription condition must carry the bot's `user_id`.
pub fn requires_condition_user_id(event_type: &str) -> bool {
    let normalized = event_type.trim().to_ascii_lowercase();
    normalized.starts_with("channel.chat.") || normalized == "channel.chat_settings.update"
}

/// Scope groups the granting token must satisfy: at least one scope from
/// every group.
pub fn required_scope_groups(event_type: &str) -> &'static [&'static [&'static str]] {
    let normalized = event_type.trim().to_ascii_lowercase();
    if normalized.starts_with("channel.channel_points_custom_reward") {
        return &[&["channel:read:redemptions", "channel:manage:redemptions"]];
    }
    if normalized.starts_with("channel.poll.") {
        return &[&["channel:read:polls", "channel:manage:polls"]];
    }
    if normalized.starts_with("channel.prediction.") {
        return &[&["channel:read:predictions", "channel:manage:predictions"]];
    }
    if normalized.starts_with("channel.goal.") {
        return &[&["channel:read:goals"]];
    }
    if normalized.starts_with("channel.charity_campaign.") {
        return &[&["channel:read:charity"]];
    }
    if normalized == "channel.ad_break.begin" {
        return &[&["channel:read:ads"]];
    }
    if normalized.starts_with("channel.hype_train.") {
        return &[&["channel:read:hype_train"]];
    }
    &[]
}

/// Scopes worth requesting from a broadcaster up front for `event_type`.
pub fn recommended_broadcaster_scopes(event_type: &str) -> &'static [&'static str] {
    let normalized = event_type.trim().to_ascii_lowercase();
    if normalized.starts_with("channel.channel_points_custom_reward") {
        return &["channel:read:redemptions"];
    }
    if normalized.starts_with("channel.poll.") {
        return &["channel:read:polls"];
    }
    if normalized.starts_with("channel.prediction.") {
        return &["channel:read:predictions"];
    }
    if normalized.starts_with("channel.goal.") {
        return &["channel:read:goals"];
    }
    if normalized.starts_with("channel.charity_campaign.") {
        return &["channel:read:charity"];
    }
    if normalized == "channel.ad_break.begin" {
        return &["channel:read:ads"];
    }
    if normalized.starts_with("channel.hype_train.") {
        return &["channel:read:hype_train"];
    }
    &[]
}

/// A scope set satisfies the requirement when it covers every group.
pub fn scopes_satisfy_groups(scopes: &[String], groups: &[&[&str]]) -> bool {
    groups
        .iter()
        .all(|group| group.iter().any(|needed| scopes.iter().any(|s| s == needed)))
}

/// Render the requirement for error messages: `a|b and c|d`.
pub fn describe_scope_groups(groups: &[&[&str]]) -> String {
    groups
        .iter()
        .map(|group| {
            let mut sorted: Vec<&str> = group.to_vec();
            sorted.sort_unstable();
            sorted.join("|")
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_only_types_never_offer_websocket() {
        for event_type in WEBSOCKET_UNSUPPORTED {
            assert_eq!(supported_upstream_transports(event_type), &[Transport::Webhook]);
        }
        assert_eq!(
            supported_upstream_transports("stream.online"),
            &[Transport::Webhook, Transport::Websocket]
        );
    }

    #[test]
    fn authorization_revoke_is_webhook_even_without_callback() {
        let (transport, _) = best_transport("user.authorization.revoke", false);
        assert_eq!(transport, Transport::Webhook);
    }

    #[test]
    fn best_transport_prefers_webhook_when_available() {
        assert_eq!(best_transport("stream.online", true).0, Transport::Webhook);
        assert_eq!(best_transport("stream.online", false).0, Transport::Websocket);
    }

    #[test]
    fn preferred_version_takes_highest_numeric() {
        assert_eq!(preferred_version("channel.moderate"), "2");
        assert_eq!(preferred_version("channel.poll.begin"), "1");
        // beta-only entries have no numeric version
        assert_eq!(preferred_version("channel.guest_star_session.begin"), "1");
    }

    #[test]
    fn chat_types_require_condition_user_id() {
        assert!(requires_condition_user_id("channel.chat.message"));
        assert!(requires_condition_user_id("channel.chat_settings.update"));
        assert!(!requires_condition_user_id("channel.follow"));
    }

    #[test]
    fn scope_groups_for_polls() {
        let groups = required_scope_groups("channel.poll.begin");
        assert!(scopes_satisfy_groups(&["channel:read:polls".to_owned()], groups));
        assert!(scopes_satisfy_groups(&["channel:manage:polls".to_owned()], groups));
        assert!(!scopes_satisfy_groups(&["chat:read".to_owned()], groups));
        assert_eq!(describe_scope_groups(groups), "channel:manage:polls|channel:read:polls");
    }

    #[test]
    fn event_type_lookup_is_case_insensitive() {
        assert!(is_known_event_type(" Stream.Online "));
        assert!(!is_known_event_type("made.up.event"));
    }
}
