//! Host policy and IP guard.
//!
//! One immutable `HostPolicy` value is built at startup and shared read-only
//! by the URL normalizer, the DNS resolver, and the redirect follower. All
//! blocking decisions funnel through it.

use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Host literals rejected outright (relaxed by `allow_local`, except the
/// metadata entries which are always blocked).
const BLOCKED_HOSTS: &[&str] = &["localhost", "0.0.0.0", "127.0.0.1", "::1"];

/// DNS suffixes that never leave the local network.
const BLOCKED_SUFFIXES: &[&str] = &[".local", ".internal"];

/// Cloud metadata endpoints. Never reachable, no matter what.
const METADATA_HOSTS: &[&str] = &["metadata.google.internal", "instance-data"];
const METADATA_IPS: &[&str] = &["169.254.169.254", "100.100.100.200", "fd00:ec2::254"];

const BLOCKED_V4: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "100.64.0.0/10",
    "169.254.0.0/16",
    "127.0.0.0/8",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

const BLOCKED_V6: &[&str] = &[
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
    "::1/128",
    "::/128",
    "2001::/32",
    "2002::/16",
    "64:ff9b::/96",
    "64:ff9b:1::/48",
];

#[derive(Debug, Clone)]
pub struct HostPolicy {
    allow_local: bool,
    blocked_hosts: BTreeSet<String>,
    blocked_suffixes: Vec<String>,
    metadata_hosts: BTreeSet<String>,
    metadata_ips: Vec<IpAddr>,
    blocked_v4: Vec<Ipv4Net>,
    blocked_v6: Vec<Ipv6Net>,
}

impl HostPolicy {
    /// `allow_local` relaxes the private/loopback ranges and the plain local
    /// host literals. Metadata endpoints stay blocked regardless.
    pub fn new(allow_local: bool) -> Self {
        let blocked_hosts = BLOCKED_HOSTS.iter().map(|s| s.to_string()).collect();
        let metadata_hosts = METADATA_HOSTS.iter().map(|s| s.to_string()).collect();
        let metadata_ips = METADATA_IPS
            .iter()
            .map(|s| s.parse().expect("static metadata ip"))
            .collect();
        let blocked_v4 = BLOCKED_V4
            .iter()
            .map(|s| s.parse().expect("static v4 net"))
            .collect();
        let blocked_v6 = BLOCKED_V6
            .iter()
            .map(|s| s.parse().expect("static v6 net"))
            .collect();
        Self {
            allow_local,
            blocked_hosts,
            blocked_suffixes: BLOCKED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            metadata_hosts,
            metadata_ips,
            blocked_v4,
            blocked_v6,
        }
    }

    pub fn allow_local(&self) -> bool {
        self.allow_local
    }

    /// Parse an IP literal: lowercases, strips brackets and an IPv6 zone id,
    /// and collapses IPv4-mapped IPv6 (`::ffff:a.b.c.d`) to the embedded
    /// IPv4 address. Returns `None` for anything that is not an IP literal.
    pub fn normalize_ip(literal: &str) -> Option<IpAddr> {
        let s = literal.trim().to_ascii_lowercase();
        if s.is_empty() {
            return None;
        }
        let s = s.strip_prefix('[').unwrap_or(&s).trim_end_matches(']');
        let s = match s.split_once('%') {
            Some((addr, _zone)) => addr,
            None => s,
        };
        let ip: IpAddr = s.parse().ok()?;
        Some(match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        })
    }

    pub fn is_metadata_ip(&self, ip: IpAddr) -> bool {
        self.metadata_ips.contains(&ip)
    }

    pub fn is_metadata_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if self.metadata_hosts.contains(&host) {
            return true;
        }
        match Self::normalize_ip(&host) {
            Some(ip) => self.is_metadata_ip(ip),
            None => false,
        }
    }

    /// True iff the address must not be dialed: metadata endpoints always,
    /// blocked ranges unless `allow_local`.
    pub fn is_blocked_ip(&self, ip: IpAddr) -> bool {
        if self.is_metadata_ip(ip) {
            return true;
        }
        if self.allow_local {
            return false;
        }
        match ip {
            IpAddr::V4(v4) => self.blocked_v4.iter().any(|n| n.contains(&v4)),
            IpAddr::V6(v6) => self.blocked_v6.iter().any(|n| n.contains(&v6)),
        }
    }

    /// Literal host-name check (the set, not DNS). IP literals are handled
    /// by `is_blocked_ip` after `normalize_ip`.
    pub fn is_blocked_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if self.metadata_hosts.contains(&host) {
            return true;
        }
        if self.allow_local {
            return false;
        }
        self.blocked_hosts.contains(&host)
    }

    pub fn is_blocked_suffix(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.blocked_suffixes.iter().any(|s| host.ends_with(s.as_str()))
    }

    /// Full host-name classification used by the normalizer and the
    /// resolver's pre-lookup gate. Does not resolve anything.
    pub fn host_is_blocked(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if self.is_blocked_host(&host) || self.is_blocked_suffix(&host) {
            return true;
        }
        match Self::normalize_ip(&host) {
            Some(ip) => self.is_blocked_ip(ip),
            None => false,
        }
    }
}

/// Canonical host form used for every policy comparison: lowercase, no
/// trailing dots, no brackets.
pub fn normalize_host(host: &str) -> String {
    let h = host.trim().to_ascii_lowercase();
    let h = h.strip_prefix('[').unwrap_or(&h).trim_end_matches(']');
    h.trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn normalize_ip_handles_zone_brackets_and_mapped() {
        assert_eq!(
            HostPolicy::normalize_ip("::ffff:127.0.0.1"),
            Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
        );
        assert_eq!(
            HostPolicy::normalize_ip("[::1]"),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(
            HostPolicy::normalize_ip("fe80::1%eth0"),
            Some("fe80::1".parse().unwrap())
        );
        assert_eq!(HostPolicy::normalize_ip(""), None);
        assert_eq!(HostPolicy::normalize_ip("example.com"), None);
    }

    #[test]
    fn blocked_ranges() {
        let p = HostPolicy::new(false);
        for s in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "100.64.0.1",
            "169.254.169.254",
            "224.0.0.1",
            "255.255.255.255",
            "::1",
            "fc00::1",
            "fe80::1",
            "ff02::1",
            "2002::1",
            "64:ff9b::a00:1",
        ] {
            let ip = HostPolicy::normalize_ip(s).unwrap();
            assert!(p.is_blocked_ip(ip), "{s} should be blocked");
        }
        for s in ["93.184.216.34", "2606:2800:220:1::1"] {
            let ip = HostPolicy::normalize_ip(s).unwrap();
            assert!(!p.is_blocked_ip(ip), "{s} should be allowed");
        }
    }

    #[test]
    fn mapped_v6_classifies_as_the_embedded_v4() {
        let p = HostPolicy::new(false);
        let ip = HostPolicy::normalize_ip("::ffff:127.0.0.1").unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(p.is_blocked_ip(ip));
    }

    #[test]
    fn allow_local_keeps_metadata_blocked() {
        let p = HostPolicy::new(true);
        assert!(!p.is_blocked_ip("127.0.0.1".parse().unwrap()));
        assert!(!p.is_blocked_ip("10.0.0.1".parse().unwrap()));
        assert!(p.is_blocked_ip("169.254.169.254".parse().unwrap()));
        assert!(p.is_blocked_ip("100.100.100.200".parse().unwrap()));
        assert!(p.is_blocked_ip("fd00:ec2::254".parse().unwrap()));
        assert!(p.is_metadata_host("metadata.google.internal"));
        assert!(p.host_is_blocked("metadata.google.internal"));
        assert!(!p.is_blocked_host("localhost"));
    }

    #[test]
    fn metadata_v6_literal_blocked_outside_general_ranges() {
        // fd00:ec2::254 sits inside ULA, but must stay blocked even when the
        // ULA range itself is relaxed.
        let p = HostPolicy::new(true);
        assert!(p.is_blocked_ip("fd00:ec2::254".parse().unwrap()));
        assert!(!p.is_blocked_ip("fd00::1".parse().unwrap()));
    }

    #[test]
    fn host_literals_and_suffixes() {
        let p = HostPolicy::new(false);
        assert!(p.is_blocked_host("localhost"));
        assert!(p.is_blocked_host("LOCALHOST"));
        assert!(p.is_blocked_host("0.0.0.0"));
        assert!(p.host_is_blocked("printer.local"));
        assert!(p.host_is_blocked("db.prod.internal"));
        assert!(p.host_is_blocked("localhost."), "trailing dot normalized away");
        assert!(!p.host_is_blocked("example.com"));
        assert!(!p.host_is_blocked("example.com."));
    }

    #[test]
    fn empty_string_is_not_blocked_as_ip() {
        let p = HostPolicy::new(false);
        assert_eq!(HostPolicy::normalize_ip(""), None);
        assert!(!p.is_blocked_suffix(""));
    }
}
