//! Broadcaster input normalization.

/// Accept a Twitch user id, a login, or a twitch.tv URL and reduce it to a
/// single bare token (id or login). The caller decides whether the token
/// still needs a Helix lookup (non-numeric tokens do).
pub fn normalize_broadcaster_id_or_login(raw: &str) -> String {
    let mut value = raw.trim().to_owned();
    if value.is_empty() {
        return String::new();
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        let without_scheme = value.splitn(2, "://").nth(1).unwrap_or("");
        let (host, path) = match without_scheme.split_once('/') {
            Some((host, path)) => (host, path),
            None => (without_scheme, ""),
        };
        if host.to_ascii_lowercase().ends_with("twitch.tv") {
            let first_segment = path.trim_matches('/').split('/').next().unwrap_or("");
            if !first_segment.is_empty() {
                value = first_segment.to_owned();
            }
        }
    }
    let mut value = value.trim().trim_start_matches('@').to_owned();
    if let Some((head, _)) = value.split_once('/') {
        value = head.to_owned();
    }
    if let Some((head, _)) = value.split_once('?') {
        value = head.to_owned();
    }
    value.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::normalize_broadcaster_id_or_login;

    #[test]
    fn numeric_ids_pass_through() {
        assert_eq!(normalize_broadcaster_id_or_login(" 12345 "), "12345");
    }

    #[test]
    fn logins_lose_at_prefix() {
        assert_eq!(normalize_broadcaster_id_or_login("@somecaster"), "somecaster");
    }

    #[test]
    fn twitch_urls_reduce_to_the_first_path_segment() {
        assert_eq!(
            normalize_broadcaster_id_or_login("https://www.twitch.tv/somecaster/videos"),
            "somecaster"
        );
        assert_eq!(
            normalize_broadcaster_id_or_login("https://twitch.tv/somecaster?ref=x"),
            "somecaster"
        );
    }

    #[test]
    fn non_twitch_urls_keep_only_the_leading_token() {
        assert_eq!(
            normalize_broadcaster_id_or_login("https://example.com/somecaster"),
            "https:"
        );
    }

    #[test]
    fn query_strings_and_slashes_are_stripped() {
        assert_eq!(normalize_broadcaster_id_or_login("somecaster?x=1"), "somecaster");
        assert_eq!(normalize_broadcaster_id_or_login("somecaster/clips"), "somecaster");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize_broadcaster_id_or_login("   "), "");
    }
}
