//! Service configuration.
//!
//! Everything is read from environment variables at startup; there is no
//! config file. Required variables fail fast with the variable name in the
//! error so a bad deploy dies before binding the listener.

use std::time::Duration;

/// Timing knobs. Defaults match production behavior; every knob can be
/// overridden through the `*_SECONDS` environment variable of the same name.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub ws_listener_cooldown: Duration,
    pub interest_disconnect_grace: Duration,
    pub interest_heartbeat_timeout: Duration,
    pub interest_unsubscribe_after_stale: Duration,
    pub gc_interval: Duration,
    pub fanout_concurrency: usize,
    pub subscription_error_cooldown: Duration,
    pub dedupe_ttl: Duration,
    pub ws_token_ttl: Duration,
    pub webhook_delivery_timeout: Duration,
    pub active_subs_cache_ttl: Duration,
    pub name_cache_ttl: Duration,
    pub chat_assets_ttl: Duration,
    pub chat_assets_stale_if_error: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            ws_listener_cooldown: Duration::from_secs(15 * 60),
            interest_disconnect_grace: Duration::from_secs(15 * 60),
            interest_heartbeat_timeout: Duration::from_secs(30 * 60),
            interest_unsubscribe_after_stale: Duration::from_secs(24 * 60 * 60),
            gc_interval: Duration::from_secs(60),
            fanout_concurrency: 32,
            subscription_error_cooldown: Duration::from_secs(60),
            dedupe_ttl: Duration::from_secs(10 * 60),
            ws_token_ttl: Duration::from_secs(60),
            webhook_delivery_timeout: Duration::from_secs(10),
            active_subs_cache_ttl: Duration::from_secs(30),
            name_cache_ttl: Duration::from_secs(15 * 60),
            chat_assets_ttl: Duration::from_secs(6 * 60 * 60),
            chat_assets_stale_if_error: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub app_host: String,
    pub app_port: u16,
    pub app_log_level: String,
    /// CSV of IPs / CIDR blocks; empty means allow all.
    pub app_allowed_ips: String,
    pub app_trust_x_forwarded_for: bool,
    /// CSV of host suffixes consumer webhook URLs must match; empty = any.
    pub app_webhook_target_allowlist: String,
    pub app_block_private_webhook_targets: bool,
    pub database_url: String,
    pub twitch_client_id: String,
    pub twitch_client_secret: String,
    pub twitch_redirect_uri: String,
    pub twitch_scopes: String,
    pub twitch_eventsub_ws_url: String,
    pub twitch_eventsub_webhook_callback_url: Option<String>,
    pub twitch_eventsub_webhook_secret: Option<String>,
    /// CSV of event types allowed to ride the shared webhook callback.
    pub twitch_eventsub_webhook_event_types: String,
    pub service_signing_secret: String,
    pub admin_api_key: String,
    pub tunables: Tunables,
}

const DEFAULT_SCOPES: &str = "channel:bot user:bot user:read:chat user:write:chat clips:edit \
     chat:read chat:edit moderator:read:followers moderator:manage:chat_messages";

impl Settings {
    /// Load from the process environment.
    pub fn load() -> Result<Settings, String> {
        Settings::load_from(|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary lookup; tests pass closures instead of
    /// mutating the process environment.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings, String> {
        let required = |name: &str| -> Result<String, String> {
            match lookup(name) {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(format!("{name} must be set")),
            }
        };
        let optional =
            |name: &str| -> Option<String> { lookup(name).filter(|v| !v.trim().is_empty()) };
        let with_default =
            |name: &str, default: &str| optional(name).unwrap_or_else(|| default.to_owned());
        let boolean = |name: &str, default: bool| -> Result<bool, String> {
            match optional(name) {
                None => Ok(default),
                Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    other => Err(format!("{name} must be a boolean, got '{other}'")),
                },
            }
        };

        let app_port = with_default("APP_PORT", "8080")
            .parse::<u16>()
            .map_err(|e| format!("APP_PORT must be a port number: {e}"))?;

        let webhook_secret = optional("TWITCH_EVENTSUB_WEBHOOK_SECRET");
        if let Some(secret) = &webhook_secret {
            if secret.len() < 10 || secret.len() > 100 {
                return Err("TWITCH_EVENTSUB_WEBHOOK_SECRET must be 10-100 characters".to_owned());
            }
        }

        let mut tunables = Tunables::default();
        let mut secs = |name: &str, slot: &mut Duration| -> Result<(), String> {
            if let Some(raw) = optional(name) {
                let n = raw
                    .parse::<u64>()
                    .map_err(|e| format!("{name} must be an integer number of seconds: {e}"))?;
                *slot = Duration::from_secs(n);
            }
            Ok(())
        };
        secs("WS_LISTENER_COOLDOWN_SECONDS", &mut tunables.ws_listener_cooldown)?;
        secs(
            "INTEREST_DISCONNECT_GRACE_SECONDS",
            &mut tunables.interest_disconnect_grace,
        )?;
        secs(
            "INTEREST_HEARTBEAT_TIMEOUT_SECONDS",
            &mut tunables.interest_heartbeat_timeout,
        )?;
        secs(
            "INTEREST_UNSUBSCRIBE_AFTER_STALE_SECONDS",
            &mut tunables.interest_unsubscribe_after_stale,
        )?;
        secs("GC_INTERVAL_SECONDS", &mut tunables.gc_interval)?;
        secs(
            "SUBSCRIPTION_ERROR_COOLDOWN_SECONDS",
            &mut tunables.subscription_error_cooldown,
        )?;
        secs("DEDUPE_TTL_SECONDS", &mut tunables.dedupe_ttl)?;
        secs("WS_TOKEN_TTL_SECONDS", &mut tunables.ws_token_ttl)?;
        secs(
            "WEBHOOK_DELIVERY_TIMEOUT_SECONDS",
            &mut tunables.webhook_delivery_timeout,
        )?;
        secs(
            "ACTIVE_SUBS_CACHE_TTL_SECONDS",
            &mut tunables.active_subs_cache_ttl,
        )?;
        secs("NAME_CACHE_TTL_SECONDS", &mut tunables.name_cache_ttl)?;
        secs("CHAT_ASSETS_TTL_SECONDS", &mut tunables.chat_assets_ttl)?;
        secs(
            "CHAT_ASSETS_STALE_IF_ERROR_SECONDS",
            &mut tunables.chat_assets_stale_if_error,
        )?;
        if let Some(raw) = optional("FANOUT_CONCURRENCY") {
            tunables.fanout_concurrency = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or("FANOUT_CONCURRENCY must be a positive integer")?;
        }

        Ok(Settings {
            app_host: with_default("APP_HOST", "0.0.0.0"),
            app_port,
            app_log_level: with_default("APP_LOG_LEVEL", "info"),
            app_allowed_ips: with_default("APP_ALLOWED_IPS", ""),
            app_trust_x_forwarded_for: boolean("APP_TRUST_X_FORWARDED_FOR", false)?,
            app_webhook_target_allowlist: with_default("APP_WEBHOOK_TARGET_ALLOWLIST", ""),
            app_block_private_webhook_targets: boolean("APP_BLOCK_PRIVATE_WEBHOOK_TARGETS", true)?,
            database_url: required("DATABASE_URL")?,
            twitch_client_id: required("TWITCH_CLIENT_ID")?,
            twitch_client_secret: required("TWITCH_CLIENT_SECRET")?,
            twitch_redirect_uri: required("TWITCH_REDIRECT_URI")?,
            twitch_scopes: with_default("TWITCH_DEFAULT_SCOPES", DEFAULT_SCOPES),
            twitch_eventsub_ws_url: with_default(
                "TWITCH_EVENTSUB_WS_URL",
                "wss://eventsub.wss.twitch.tv/ws",
            ),
            twitch_eventsub_webhook_callback_url: optional("TWITCH_EVENTSUB_WEBHOOK_CALLBACK_URL"),
            twitch_eventsub_webhook_secret: webhook_secret,
            twitch_eventsub_webhook_event_types: with_default(
                "TWITCH_EVENTSUB_WEBHOOK_EVENT_TYPES",
                "stream.online,stream.offline",
            ),
            service_signing_secret: required("SERVICE_SIGNING_SECRET")?,
            admin_api_key: required("ADMIN_API_KEY")?,
            tunables,
        })
    }

    /// Webhook upstream transport is usable only when both halves are set.
    pub fn webhook_available(&self) -> bool {
        self.twitch_eventsub_webhook_callback_url.is_some()
            && self.twitch_eventsub_webhook_secret.is_some()
    }
}

/// Split a CSV setting into trimmed, non-empty entries.
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/bridge"),
            ("TWITCH_CLIENT_ID", "cid"),
            ("TWITCH_CLIENT_SECRET", "csecret"),
            ("TWITCH_REDIRECT_URI", "https://example.com/cb"),
            ("SERVICE_SIGNING_SECRET", "signing"),
            ("ADMIN_API_KEY", "admin"),
        ])
    }

    fn load(env: &HashMap<&str, &str>) -> Result<Settings, String> {
        Settings::load_from(|name| env.get(name).map(|v| (*v).to_owned()))
    }

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let settings = load(&base_env()).expect("settings should load");
        assert_eq!(settings.app_host, "0.0.0.0");
        assert_eq!(settings.app_port, 8080);
        assert_eq!(settings.twitch_eventsub_ws_url, "wss://eventsub.wss.twitch.tv/ws");
        assert_eq!(
            settings.twitch_eventsub_webhook_event_types,
            "stream.online,stream.offline"
        );
        assert!(!settings.webhook_available());
        assert!(settings.app_block_private_webhook_targets);
        assert_eq!(settings.tunables.ws_listener_cooldown, Duration::from_secs(900));
        assert_eq!(settings.tunables.fanout_concurrency, 32);
    }

    #[test]
    fn missing_required_var_names_the_variable() {
        let mut env = base_env();
        env.remove("DATABASE_URL");
        let err = load(&env).expect_err("must fail");
        assert!(err.contains("DATABASE_URL"));
    }

    #[test]
    fn webhook_secret_length_is_enforced() {
        let mut env = base_env();
        env.insert("TWITCH_EVENTSUB_WEBHOOK_SECRET", "short");
        let err = load(&env).expect_err("must fail");
        assert!(err.contains("10-100"));
    }

    #[test]
    fn webhook_available_requires_both_callback_and_secret() {
        let mut env = base_env();
        env.insert("TWITCH_EVENTSUB_WEBHOOK_CALLBACK_URL", "https://cb.example.com/hook");
        let settings = load(&env).expect("settings should load");
        assert!(!settings.webhook_available());

        env.insert("TWITCH_EVENTSUB_WEBHOOK_SECRET", "0123456789abc");
        let settings = load(&env).expect("settings should load");
        assert!(settings.webhook_available());
    }

    #[test]
    fn tunable_overrides_parse_seconds() {
        let mut env = base_env();
        env.insert("WS_LISTENER_COOLDOWN_SECONDS", "120");
        env.insert("FANOUT_CONCURRENCY", "4");
        let settings = load(&env).expect("settings should load");
        assert_eq!(settings.tunables.ws_listener_cooldown, Duration::from_secs(120));
        assert_eq!(settings.tunables.fanout_concurrency, 4);
    }

    #[test]
    fn bad_boolean_is_rejected() {
        let mut env = base_env();
        env.insert("APP_TRUST_X_FORWARDED_FOR", "maybe");
        assert!(load(&env).is_err());
    }

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(split_csv(" a, b ,, c "), vec!["a", "b", "c"]);
        assert!(split_csv("").is_empty());
    }
}
