//! Virtual-host matching for Lite routes.

use crate::config::{LiteConfig, RouteConfig};

/// Returns true if the pattern matches the host. Matching is
/// case-insensitive; a leading "*." wildcards exactly one label.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        let host = host.to_ascii_lowercase();
        let suffix = suffix.to_ascii_lowercase();
        if let Some(head) = host.strip_suffix(&suffix) {
            if let Some(label) = head.strip_suffix('.') {
                return !label.is_empty() && !label.contains('.');
            }
        }
        return false;
    }
    pattern.eq_ignore_ascii_case(host)
}

/// First route whose host patterns match, in declaration order.
pub fn find_route<'a>(lite: &'a LiteConfig, host: &str) -> Option<&'a RouteConfig> {
    lite.routes
        .iter()
        .find(|route| route.hosts.iter().any(|pattern| host_matches(pattern, host)))
}

/// Strips the forge marker and any TCPShield suffix from a handshake
/// address, leaving the bare virtual host.
pub fn clean_virtual_host(address: &str) -> &str {
    let host = address.split('\0').next().unwrap_or(address);
    let host = host.split("///").next().unwrap_or(host);
    host.trim_end_matches('.')
}

/// Extracts the real client address from a TCPShield-formatted handshake
/// address ("host///real-ip:port///timestamp").
pub fn tcpshield_real_ip(address: &str) -> Option<&str> {
    let mut parts = address.split("///");
    let _host = parts.next()?;
    parts.next().filter(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lite::strategy::Strategy;
    use std::time::Duration;

    fn route(hosts: &[&str]) -> RouteConfig {
        RouteConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            backends: vec!["10.0.0.1".into()],
            strategy: Strategy::Random,
            proxy_protocol: false,
            real_ip_from_tcpshield: false,
            modify_virtual_host: false,
            cache_ping_ttl: Duration::ZERO,
            fallback: None,
        }
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(host_matches("mc.example.com", "MC.Example.COM"));
        assert!(!host_matches("mc.example.com", "other.example.com"));
    }

    #[test]
    fn wildcard_matches_exactly_one_label() {
        assert!(host_matches("*.example.com", "mc.example.com"));
        assert!(host_matches("*.example.com", "HUB.example.com"));
        assert!(!host_matches("*.example.com", "example.com"));
        assert!(!host_matches("*.example.com", "a.b.example.com"));
        assert!(!host_matches("*.example.com", ".example.com"));
    }

    #[test]
    fn first_declared_route_wins() {
        let lite = LiteConfig {
            enabled: true,
            routes: vec![route(&["*.example.com"]), route(&["mc.example.com"])],
            latency_probe_interval: Duration::from_secs(15),
        };
        let found = find_route(&lite, "mc.example.com").unwrap();
        assert_eq!(found.hosts, vec!["*.example.com"]);
    }

    #[test]
    fn unmatched_host_finds_nothing() {
        let lite = LiteConfig {
            enabled: true,
            routes: vec![route(&["mc.example.com"])],
            latency_probe_interval: Duration::from_secs(15),
        };
        assert!(find_route(&lite, "other.net").is_none());
    }

    #[test]
    fn cleans_forge_and_tcpshield_suffixes() {
        assert_eq!(clean_virtual_host("mc.example.com"), "mc.example.com");
        assert_eq!(clean_virtual_host("mc.example.com\0FML\0"), "mc.example.com");
        assert_eq!(
            clean_virtual_host("mc.example.com///203.0.113.9:5000///1700000000"),
            "mc.example.com"
        );
        assert_eq!(clean_virtual_host("mc.example.com."), "mc.example.com");
    }

    #[test]
    fn extracts_tcpshield_real_ip() {
        assert_eq!(
            tcpshield_real_ip("mc.example.com///203.0.113.9:5000///1700000000"),
            Some("203.0.113.9:5000")
        );
        assert_eq!(tcpshield_real_ip("mc.example.com"), None);
    }
}
