//! Network guards: downstream-WS IP allow list and consumer webhook target
//! validation (SSRF).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ---------------------------------------------------------------------------
// IP allow list
// ---------------------------------------------------------------------------

/// One entry of `APP_ALLOWED_IPS`: a bare address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn parse(raw: &str) -> Result<IpNetwork, String> {
        let raw = raw.trim();
        let (addr_part, prefix_part) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (raw, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| format!("Invalid APP_ALLOWED_IPS entry '{raw}'. Use IPv4/IPv6 or CIDR values."))?;
        let max_prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_part {
            None => max_prefix,
            Some(p) => {
                let parsed: u8 = p.parse().map_err(|_| {
                    format!("Invalid APP_ALLOWED_IPS entry '{raw}'. Use IPv4/IPv6 or CIDR values.")
                })?;
                if parsed > max_prefix {
                    return Err(format!(
                        "Invalid APP_ALLOWED_IPS entry '{raw}'. Use IPv4/IPv6 or CIDR values."
                    ));
                }
                parsed
            }
        };
        Ok(IpNetwork { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(candidate)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(candidate) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(candidate)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (u128::from(net) & mask) == (u128::from(candidate) & mask)
            }
            _ => false,
        }
    }
}

pub fn parse_allowed_ip_networks(raw: &str) -> Result<Vec<IpNetwork>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(IpNetwork::parse)
        .collect()
}

/// Pick the effective client IP, honoring `x-forwarded-for` only when the
/// deployment says the proxy header can be trusted.
pub fn resolve_client_ip(
    direct_host: Option<&str>,
    x_forwarded_for: Option<&str>,
    trust_x_forwarded_for: bool,
) -> Option<String> {
    if trust_x_forwarded_for {
        if let Some(header) = x_forwarded_for {
            let forwarded = header.split(',').next().unwrap_or("").trim();
            if !forwarded.is_empty() {
                return Some(forwarded.to_owned());
            }
        }
    }
    direct_host.map(str::to_owned)
}

/// An empty allow list admits everyone; otherwise the client IP must parse
/// and fall inside one of the networks.
pub fn is_ip_allowed(client_ip: Option<&str>, networks: &[IpNetwork]) -> bool {
    if networks.is_empty() {
        return true;
    }
    let Some(raw) = client_ip else { return false };
    let Ok(parsed) = raw.parse::<IpAddr>() else {
        return false;
    };
    networks.iter().any(|network| network.contains(parsed))
}

// ---------------------------------------------------------------------------
// Webhook target validation
// ---------------------------------------------------------------------------

pub fn parse_webhook_target_allowlist(raw: &str) -> Result<Vec<String>, String> {
    let mut hosts = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let host = entry.to_ascii_lowercase();
        let host = host.trim_start_matches('.').to_owned();
        if host.contains("://") || host.contains('/') {
            return Err(format!(
                "Invalid APP_WEBHOOK_TARGET_ALLOWLIST entry '{host}'. Use hostnames only."
            ));
        }
        hosts.push(host);
    }
    Ok(hosts)
}

pub fn host_matches_allowlist(host: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let normalized = host.trim().to_ascii_lowercase();
    let normalized = normalized.trim_end_matches('.');
    allowlist
        .iter()
        .any(|allowed| normalized == allowed || normalized.ends_with(&format!(".{allowed}")))
}

pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => is_public_v6(v6),
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    // 240.0.0.0/4 is reserved but std has no stable predicate for it.
    let reserved = ip.octets()[0] >= 240 && !ip.is_broadcast();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || reserved)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    let unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let link_local = (segments[0] & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() || unique_local || link_local)
}

#[derive(Debug, PartialEq, Eq)]
struct SplitUrl {
    scheme: String,
    host: String,
    port: Option<u16>,
    has_userinfo: bool,
}

fn split_url(raw: &str) -> Option<SplitUrl> {
    let (scheme, rest) = raw.split_once("://")?;
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    if authority.is_empty() {
        return None;
    }
    let (has_userinfo, host_port) = match authority.rsplit_once('@') {
        Some((_, host_port)) => (true, host_port),
        None => (false, authority),
    };
    let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>().ok()?),
            None => None,
        };
        (host.to_owned(), port)
    } else {
        match host_port.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                (host.to_owned(), Some(port.parse::<u16>().ok()?))
            }
            _ => (host_port.to_owned(), None),
        }
    };
    Some(SplitUrl {
        scheme: scheme.to_ascii_lowercase(),
        host: host.trim().to_ascii_lowercase().trim_end_matches('.').to_owned(),
        port,
        has_userinfo,
    })
}

/// Validate a consumer-supplied webhook URL. Returns a human-readable
/// rejection reason suitable for a 422 response body.
pub async fn validate_webhook_target(
    raw_url: &str,
    allowlist: &[String],
    block_private_targets: bool,
) -> Result<(), String> {
    let split =
        split_url(raw_url).ok_or_else(|| "webhook_url must be a valid absolute URL".to_owned())?;
    if split.scheme != "http" && split.scheme != "https" {
        return Err("webhook_url must use http or https".to_owned());
    }
    if split.has_userinfo {
        return Err("webhook_url must not contain userinfo credentials".to_owned());
    }
    if split.host.is_empty() {
        return Err("webhook_url host is required".to_owned());
    }
    if !host_matches_allowlist(&split.host, allowlist) {
        return Err("webhook_url host is not allowed by APP_WEBHOOK_TARGET_ALLOWLIST".to_owned());
    }
    if !block_private_targets {
        return Ok(());
    }
    if let Ok(literal) = split.host.parse::<IpAddr>() {
        if !is_public_ip(literal) {
            return Err("webhook_url target IP must be public".to_owned());
        }
        return Ok(());
    }
    if split.host.ends_with(".localhost")
        || split.host.ends_with(".local")
        || split.host.ends_with(".internal")
        || split.host == "localhost"
    {
        return Err("webhook_url target host is not public".to_owned());
    }
    let port = split.port.unwrap_or(if split.scheme == "https" { 443 } else { 80 });
    let resolved = tokio::net::lookup_host((split.host.as_str(), port))
        .await
        .map_err(|e| format!("webhook_url host resolution failed: {e}"))?
        .collect::<Vec<_>>();
    if resolved.is_empty() {
        return Err("webhook_url host resolution returned no addresses".to_owned());
    }
    for addr in resolved {
        if !is_public_ip(addr.ip()) {
            return Err("webhook_url target host resolves to non-public IP address".to_owned());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_and_bare_addresses_parse() {
        let networks = parse_allowed_ip_networks("10.0.0.0/8, 192.168.1.7 , ::1").expect("parse");
        assert_eq!(networks.len(), 3);
        assert!(networks[0].contains("10.200.3.4".parse().unwrap()));
        assert!(!networks[0].contains("11.0.0.1".parse().unwrap()));
        assert!(networks[1].contains("192.168.1.7".parse().unwrap()));
        assert!(!networks[1].contains("192.168.1.8".parse().unwrap()));
        assert!(networks[2].contains("::1".parse().unwrap()));
    }

    #[test]
    fn bad_allowlist_entries_are_rejected() {
        assert!(parse_allowed_ip_networks("not-an-ip").is_err());
        assert!(parse_allowed_ip_networks("10.0.0.0/33").is_err());
    }

    #[test]
    fn empty_allow_list_admits_everyone() {
        assert!(is_ip_allowed(Some("203.0.113.9"), &[]));
        assert!(is_ip_allowed(None, &[]));
    }

    #[test]
    fn populated_allow_list_requires_membership() {
        let networks = parse_allowed_ip_networks("10.0.0.0/8").unwrap();
        assert!(is_ip_allowed(Some("10.1.2.3"), &networks));
        assert!(!is_ip_allowed(Some("203.0.113.9"), &networks));
        assert!(!is_ip_allowed(Some("garbage"), &networks));
        assert!(!is_ip_allowed(None, &networks));
    }

    #[test]
    fn forwarded_header_is_used_only_when_trusted() {
        assert_eq!(
            resolve_client_ip(Some("10.0.0.1"), Some("203.0.113.9, 10.0.0.1"), true).as_deref(),
            Some("203.0.113.9")
        );
        assert_eq!(
            resolve_client_ip(Some("10.0.0.1"), Some("203.0.113.9"), false).as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(resolve_client_ip(None, None, true), None);
    }

    #[test]
    fn host_allowlist_matches_suffixes() {
        let allowlist = parse_webhook_target_allowlist("example.com, .svc.internal-corp.net").unwrap();
        assert!(host_matches_allowlist("example.com", &allowlist));
        assert!(host_matches_allowlist("hooks.example.com", &allowlist));
        assert!(!host_matches_allowlist("example.com.evil.net", &allowlist));
        assert!(host_matches_allowlist("a.svc.internal-corp.net", &allowlist));
    }

    #[test]
    fn allowlist_entries_must_be_bare_hostnames() {
        assert!(parse_webhook_target_allowlist("https://example.com").is_err());
        assert!(parse_webhook_target_allowlist("example.com/path").is_err());
    }

    #[test]
    fn public_ip_classification() {
        assert!(is_public_ip("93.184.216.34".parse().unwrap()));
        assert!(!is_public_ip("10.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("169.254.1.1".parse().unwrap()));
        assert!(!is_public_ip("224.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("255.255.255.255".parse().unwrap()));
        assert!(!is_public_ip("240.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("::1".parse().unwrap()));
        assert!(!is_public_ip("fe80::1".parse().unwrap()));
        assert!(!is_public_ip("fc00::1".parse().unwrap()));
        assert!(is_public_ip("2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()));
    }

    #[test]
    fn url_splitting_handles_ports_userinfo_and_v6() {
        let split = split_url("https://hooks.example.com:8443/cb?x=1").unwrap();
        assert_eq!(split.host, "hooks.example.com");
        assert_eq!(split.port, Some(8443));
        assert!(!split.has_userinfo);

        assert!(split_url("https://user:pw@example.com/cb").unwrap().has_userinfo);
        assert_eq!(split_url("http://[::1]:8080/cb").unwrap().host, "::1");
        assert!(split_url("no-scheme").is_none());
    }

    #[tokio::test]
    async fn literal_private_ips_are_rejected() {
        let err = validate_webhook_target("http://10.0.0.5/hook", &[], true)
            .await
            .expect_err("private target must fail");
        assert!(err.contains("public"));
    }

    #[tokio::test]
    async fn literal_public_ips_pass_without_dns() {
        validate_webhook_target("https://93.184.216.34/hook", &[], true)
            .await
            .expect("public literal should pass");
    }

    #[tokio::test]
    async fn ftp_scheme_is_rejected() {
        let err = validate_webhook_target("ftp://example.com/hook", &[], true)
            .await
            .expect_err("scheme must fail");
        assert!(err.contains("http"));
    }

    #[tokio::test]
    async fn internal_suffixes_are_rejected() {
        for url in [
            "https://db.internal/hook",
            "https://printer.local/hook",
            "https://me.localhost/hook",
            "http://localhost/hook",
        ] {
            assert!(validate_webhook_target(url, &[], true).await.is_err(), "{url}");
        }
    }

    #[tokio::test]
    async fn allowlist_violation_is_rejected_before_dns() {
        let allowlist = parse_webhook_target_allowlist("example.com").unwrap();
        let err = validate_webhook_target("https://other.net/hook", &allowlist, true)
            .await
            .expect_err("allowlist must fail");
        assert!(err.contains("APP_WEBHOOK_TARGET_ALLOWLIST"));
    }

    #[tokio::test]
    async fn private_targets_allowed_when_blocking_disabled() {
        validate_webhook_target("http://10.0.0.5/hook", &[], false)
            .await
            .expect("blocking disabled should pass");
    }
}
