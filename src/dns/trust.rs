//! Trusted-proxy client IP rewrite
//!
//! `X-Forwarded-For` is only honored when the directly-connecting peer is
//! on a configured trust list; otherwise the socket peer address is used
//! as-is. Mirrors the original `utils.extract_client_ip_from_request`,
//! which both the GET and POST DoH handlers shared. This is for logging
//! and the `origin_ip` passed to the upstream resolver only — it never
//! affects where a response is routed.

use std::net::IpAddr;

/// The set of peers allowed to set X-Forwarded-For, defaulting to
/// loopback as spec.md section 4.G requires.
#[derive(Debug, Clone)]
pub struct TrustedProxies {
    trusted: Vec<IpAddr>,
}

impl Default for TrustedProxies {
    fn default() -> Self {
        Self {
            trusted: vec![
                IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
                IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            ],
        }
    }
}

impl TrustedProxies {
    pub fn new(trusted: Vec<IpAddr>) -> Self {
        Self { trusted }
    }

    /// Parse a list of textual addresses, skipping ones that don't parse
    /// rather than failing configuration load outright.
    pub fn from_strs(values: &[String]) -> Self {
        Self {
            trusted: values.iter().filter_map(|s| s.parse().ok()).collect(),
        }
    }

    /// An empty trust list means "accept `X-Forwarded-For` from any
    /// peer" per spec section 4.G ("If empty, accept `X-Forwarded-For`
    /// from any peer"), not "trust nobody".
    pub fn is_trusted(&self, peer: &IpAddr) -> bool {
        self.trusted.is_empty() || self.trusted.contains(peer)
    }

    /// Resolve the logical client IP for a connection: if `peer` is a
    /// trusted proxy and `forwarded_for` carries a value, use the last
    /// address in that header, per spec section 4.G; otherwise fall back
    /// to `peer`.
    pub fn resolve_client_ip(&self, peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !self.is_trusted(&peer) {
            return peer;
        }

        forwarded_for
            .and_then(|header| header.split(',').last())
            .map(|s| s.trim())
            .and_then(|s| s.parse::<IpAddr>().ok())
            .unwrap_or(peer)
    }
}
