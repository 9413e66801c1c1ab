//! Host admission: deciding whether a `host[:port]` may be contacted.
//!
//! Two lists drive the decision:
//!
//! - The **blacklist** ([`AddressList`]) holds IP addresses, CIDR ranges and
//!   literal `host` / `host:port` strings. A match always denies, regardless
//!   of the allow-list. The same list is consulted by the connector for every
//!   address a hostname resolves to.
//! - The **allow-list** ([`AllowList`]) holds domains and CIDR ranges. A domain
//!   entry admits the domain itself and its true subdomains only:
//!   `example.com` admits `sub.example.com` but not `notexample.com`.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

use crate::{ProxyError, Result};

/// Blacklist used when the configuration does not provide one: loopback,
/// link-local, private and other reserved ranges for IPv4 and IPv6.
pub const DEFAULT_BLACKLIST: [&str; 22] = [
    "127.0.0.0/8",
    "::1/128",
    "169.254.0.0/16",
    "fe80::/10",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "fc00::/7",
    "0.0.0.0/8",
    "100.64.0.0/10",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "198.18.0.0/15",
    "192.88.99.0/24",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "2001:db8::/32",
    "ff00::/8",
];

/// One parsed list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    /// A single address or a CIDR range.
    Net(IpNet),
    /// A lowercased hostname or `host:port` string.
    Literal(String),
}

impl Entry {
    fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(net) = trimmed.parse::<IpNet>() {
            return Some(Self::Net(net.trunc()));
        }
        if let Ok(ip) = unbracket(trimmed).parse::<IpAddr>() {
            return Some(Self::Net(IpNet::from(ip)));
        }
        Some(Self::Literal(trimmed.to_ascii_lowercase()))
    }
}

/// Strips the brackets from an IPv6 literal such as `[::1]`.
fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Parses `host` as an IP literal, folding IPv4-mapped IPv6 addresses
/// (`::ffff:127.0.0.1`) into their IPv4 form.
pub fn parse_ip(host: &str) -> Option<IpAddr> {
    unbracket(host).parse::<IpAddr>().ok().map(canonical_ip)
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}

fn host_port(host: &str, port: Option<u16>) -> Option<String> {
    port.map(|p| format!("{}:{p}", host.to_ascii_lowercase()))
}

/// The blacklist: addresses, ranges and literal hosts that may never be
/// contacted.
///
/// Entries form a union: a host is blocked when any literal entry equals
/// its `host` or `host:port` (case-insensitive), or when the host is an IP
/// literal inside any network entry. Ports never affect network entries.
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    entries: Vec<Entry>,
}

impl AddressList {
    /// Builds a list from configuration strings. Blank entries are ignored.
    pub fn new<S: AsRef<str>>(raw: &[S]) -> Self {
        Self {
            entries: raw.iter().filter_map(|s| Entry::parse(s.as_ref())).collect(),
        }
    }

    /// The built-in reserved-range blacklist.
    pub fn default_blacklist() -> Self {
        Self::new(&DEFAULT_BLACKLIST)
    }

    /// Returns `true` if the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if `ip` falls inside any network entry.
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        let ip = canonical_ip(ip);
        self.entries.iter().any(|entry| match entry {
            Entry::Net(net) => net.contains(&ip),
            Entry::Literal(lit) => lit.parse::<IpAddr>().is_ok_and(|l| l == ip),
        })
    }

    /// Returns `true` if `host` (optionally with `port`) is blacklisted.
    pub fn is_blocked(&self, host: &str, port: Option<u16>) -> bool {
        let lower = unbracket(host).to_ascii_lowercase();
        let with_port = host_port(&lower, port);

        if let Some(ip) = parse_ip(&lower) {
            if self.contains_ip(ip) {
                return true;
            }
        }

        self.entries.iter().any(|entry| match entry {
            Entry::Literal(lit) => *lit == lower || with_port.as_ref() == Some(lit),
            Entry::Net(_) => false,
        })
    }
}

/// The allow-list: domains and ranges the gateway proxies for.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<Entry>,
}

impl AllowList {
    /// Builds an allow-list from configuration strings.
    pub fn new<S: AsRef<str>>(raw: &[S]) -> Self {
        Self {
            entries: raw.iter().filter_map(|s| Entry::parse(s.as_ref())).collect(),
        }
    }

    /// Returns `true` if `host` is admitted by some entry.
    pub fn admits(&self, host: &str, port: Option<u16>) -> bool {
        let lower = unbracket(host).to_ascii_lowercase();
        let with_port = host_port(&lower, port);
        let ip = parse_ip(&lower);

        self.entries.iter().any(|entry| match entry {
            Entry::Net(net) => ip.is_some_and(|ip| net.contains(&ip)),
            Entry::Literal(domain) => {
                lower == *domain
                    || with_port.as_ref() == Some(domain)
                    || lower
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
        })
    }
}

/// The admission decision for outbound hosts.
///
/// Consulted before the first request and again before every redirect hop.
#[derive(Debug, Clone)]
pub struct HostGuard {
    blacklist: AddressList,
    allow_list: AllowList,
    allow_all: bool,
}

impl HostGuard {
    /// Creates a guard from a blacklist, an allow-list and the allow-all flag.
    pub fn new(blacklist: AddressList, allow_list: AllowList, allow_all: bool) -> Self {
        Self {
            blacklist,
            allow_list,
            allow_all,
        }
    }

    /// The blacklist, shared with the connector's resolved-address check.
    pub fn blacklist(&self) -> &AddressList {
        &self.blacklist
    }

    /// Admits or rejects `host`.
    ///
    /// The blacklist is checked first and wins over both the allow-all flag
    /// and any allow-list entry.
    pub fn check(&self, host: &str, port: Option<u16>) -> Result<()> {
        if self.blacklist.is_blocked(host, port) {
            warn!(host, port, "blacklisted host rejected");
            return Err(ProxyError::BlacklistedAddress(host.to_owned()));
        }

        if self.allow_all || self.allow_list.admits(host, port) {
            return Ok(());
        }

        warn!(host, port, "host not in allow-list");
        Err(ProxyError::HostNotAllowed(host.to_owned()))
    }
}
