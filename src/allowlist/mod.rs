//! Client-address gating for the admin surface.
//!
//! Patterns are exact addresses or CIDR ranges, validated when the
//! configuration is loaded. A malformed pattern aborts startup instead of
//! silently widening the gate, and the check runs before any credential work
//! so a rejection leaks nothing about the submitted account.

use ipnetwork::IpNetwork;
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    #[error("invalid allowlist pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: ipnetwork::IpNetworkError,
    },
}

#[derive(Clone, Debug, Default)]
pub struct IpAllowlist {
    networks: Vec<IpNetwork>,
}

impl IpAllowlist {
    /// Parse configured patterns. Bare addresses become single-host networks.
    ///
    /// # Errors
    /// Returns [`AllowlistError::InvalidPattern`] for the first pattern that
    /// is neither an address nor a CIDR range.
    pub fn parse(patterns: &[String]) -> Result<Self, AllowlistError> {
        let mut networks = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let trimmed = pattern.trim();
            if trimmed.is_empty() {
                continue;
            }
            let network =
                trimmed
                    .parse::<IpNetwork>()
                    .map_err(|source| AllowlistError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    })?;
            networks.push(network);
        }
        Ok(Self { networks })
    }

    /// An empty allowlist disables the gate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    #[must_use]
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.is_empty() || self.networks.iter().any(|network| network.contains(ip))
    }

    /// Gate an address as reported by the transport layer.
    ///
    /// With a configured allowlist, a missing or unparseable address is
    /// denied.
    #[must_use]
    pub fn permits(&self, client_ip: Option<&str>) -> bool {
        if self.is_empty() {
            return true;
        }
        client_ip
            .and_then(|value| value.trim().parse::<IpAddr>().ok())
            .is_some_and(|ip| self.is_allowed(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::{AllowlistError, IpAllowlist};

    fn patterns(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn exact_address_matches() {
        let allowlist = IpAllowlist::parse(&patterns(&["203.0.113.7"])).unwrap();
        assert!(allowlist.permits(Some("203.0.113.7")));
        assert!(!allowlist.permits(Some("203.0.113.8")));
    }

    #[test]
    fn cidr_range_matches_members_only() {
        let allowlist = IpAllowlist::parse(&patterns(&["10.1.0.0/16", "192.0.2.1"])).unwrap();
        assert!(allowlist.permits(Some("10.1.200.3")));
        assert!(allowlist.permits(Some("192.0.2.1")));
        assert!(!allowlist.permits(Some("10.2.0.1")));
        assert!(!allowlist.permits(Some("192.0.2.2")));
    }

    #[test]
    fn ipv6_patterns_are_supported() {
        let allowlist = IpAllowlist::parse(&patterns(&["2001:db8::/32"])).unwrap();
        assert!(allowlist.permits(Some("2001:db8::1")));
        assert!(!allowlist.permits(Some("2001:db9::1")));
    }

    #[test]
    fn malformed_pattern_is_a_configuration_error() {
        let result = IpAllowlist::parse(&patterns(&["10.0.0.0/16", "not-an-address"]));
        assert!(matches!(
            result,
            Err(AllowlistError::InvalidPattern { pattern, .. }) if pattern == "not-an-address"
        ));
    }

    #[test]
    fn empty_list_disables_the_gate() {
        let allowlist = IpAllowlist::parse(&[]).unwrap();
        assert!(allowlist.is_empty());
        assert!(allowlist.permits(Some("203.0.113.50")));
        assert!(allowlist.permits(None));
    }

    #[test]
    fn configured_list_denies_missing_or_garbled_addresses() {
        let allowlist = IpAllowlist::parse(&patterns(&["203.0.113.0/24"])).unwrap();
        assert!(!allowlist.permits(None));
        assert!(!allowlist.permits(Some("not-an-ip")));
    }
}
