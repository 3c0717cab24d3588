//! Secret redaction for audit records and event traces.

use serde_json::Value;

const SENSITIVE_TOKENS: &[&str] = &[
    "secret",
    "token",
    "authorization",
    "api_key",
    "password",
    "client_secret",
    "x_client_secret",
    "ws_token",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase().replace('-', "_");
    SENSITIVE_TOKENS.iter().any(|token| normalized.contains(token))
}

/// Mask a secret, keeping the last four characters for correlation.
pub fn mask_secret(value: &str) -> String {
    if value.len() <= 4 {
        return "***".to_owned();
    }
    let tail: String = value.chars().skip(value.chars().count().saturating_sub(4)).collect();
    format!("***{tail}")
}

/// Recursively replace values under sensitive keys with masked forms.
pub fn redact_json(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if is_sensitive_key(key) {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out.insert(key.clone(), Value::String(mask_secret(&rendered)));
                } else {
                    out.insert(key.clone(), redact_json(value));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}

/// Redact sensitive query items in a delivery target URL. Non-URL targets
/// are masked wholesale when they look like they embed a credential.
pub fn redact_target(target: &str) -> String {
    if let Some((scheme, rest)) = target.split_once("://") {
        if !rest.is_empty() {
            if let Some((base, query)) = rest.split_once('?') {
                let redacted: Vec<String> = query
                    .split('&')
                    .map(|item| match item.split_once('=') {
                        Some((key, value)) if is_sensitive_key(key) => {
                            format!("{key}={}", mask_secret(value))
                        }
                        _ => item.to_owned(),
                    })
                    .collect();
                return format!("{scheme}://{base}?{}", redacted.join("&"));
            }
            return target.to_owned();
        }
    }
    let lowered = target.to_ascii_lowercase();
    if ["secret", "token", "authorization", "api_key", "password"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        return mask_secret(target);
    }
    target.to_owned()
}

/// Cap a serialized payload at `max_chars`, marking the cut explicitly.
pub fn truncate_payload(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_cover_header_and_snake_variants() {
        assert!(is_sensitive_key("X-Client-Secret"));
        assert!(is_sensitive_key("ws_token"));
        assert!(is_sensitive_key("Authorization"));
        assert!(!is_sensitive_key("broadcaster_user_id"));
    }

    #[test]
    fn mask_keeps_last_four() {
        assert_eq!(mask_secret("supersecretvalue"), "***alue");
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret(""), "***");
    }

    #[test]
    fn redact_json_walks_nested_structures() {
        let payload = json!({
            "event": {"access_token": "tok-12345", "broadcaster_user_id": "222"},
            "items": [{"client_secret": "shhh-9999"}],
        });
        let redacted = redact_json(&payload);
        assert_eq!(redacted["event"]["access_token"], json!("***2345"));
        assert_eq!(redacted["event"]["broadcaster_user_id"], json!("222"));
        assert_eq!(redacted["items"][0]["client_secret"], json!("***9999"));
    }

    #[test]
    fn redact_target_masks_sensitive_query_items_only() {
        let out = redact_target("https://svc.example.com/hook?ws_token=abcdef123456&kind=chat");
        assert_eq!(out, "https://svc.example.com/hook?ws_token=***3456&kind=chat");
    }

    #[test]
    fn redact_target_leaves_plain_paths_alone() {
        assert_eq!(redact_target("/ws/events"), "/ws/events");
        assert_eq!(redact_target("twitch:eventsub"), "twitch:eventsub");
    }

    #[test]
    fn bare_credentialish_targets_are_masked() {
        assert_eq!(redact_target("password=hunter2zz"), "***r2zz");
    }

    #[test]
    fn truncation_appends_marker() {
        let out = truncate_payload("abcdefgh".to_owned(), 4);
        assert_eq!(out, "abcd... [truncated]");
        assert_eq!(truncate_payload("short".to_owned(), 10), "short");
    }
}
