//! Address derivation for the fixed host addressing scheme.
//!
//! A guest is identified by `(subnet, server)`; its private addresses are
//! `192.168.{subnet}.{server}` and `fd00:{subnet}::{server}`. Public IPv6
//! addresses are formed from the subnet's routed prefix with the same host
//! part.

use std::fmt;
use std::net::Ipv4Addr;

use tracing::debug;

pub fn private_ipv4(subnet: u8, server: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, subnet, server)
}

pub fn private_ipv4_subnet(subnet: u8) -> String {
    format!("192.168.{subnet}.0/24")
}

pub fn private_ipv6(subnet: u8, host: &str) -> String {
    format!("fd00:{subnet}::{host}")
}

pub fn private_ipv6_subnet(subnet: u8) -> String {
    format!("fd00:{subnet}::/64")
}

pub fn public_ipv6(prefix: &str, subnet: u8, host: &str) -> String {
    format!("{prefix}:{subnet}::{host}")
}

/// An extra-address suffix is valid when it is exactly one hex digit.
pub fn is_valid_ipv6_suffix(suffix: &str) -> bool {
    suffix.len() == 1 && suffix.bytes().all(|b| b.is_ascii_hexdigit())
}

/// IPv6 host parts for a server: the server ID itself plus one per valid
/// extra suffix (`{server}{suffix}`). Invalid suffixes are skipped by
/// policy, not treated as errors.
pub fn ipv6_hosts(server: u8, extra_suffixes: &[String]) -> Vec<String> {
    let mut hosts = vec![server.to_string()];
    for suffix in extra_suffixes {
        if is_valid_ipv6_suffix(suffix) {
            hosts.push(format!("{server}{suffix}"));
        } else {
            debug!(server, suffix = %suffix, "Skipping invalid IPv6 suffix");
        }
    }
    hosts
}

/// A combined VM identifier as used by address-management tooling:
/// a 4–6 digit decimal string whose last three digits are the server ID and
/// whose prefix is the subnet ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmId {
    pub subnet: u8,
    pub server: u8,
}

impl VmId {
    /// Parse a combined ID. Rejects strings outside 4–6 characters, strings
    /// with non-digits, and components that do not fit an address octet.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() < 4 || s.len() > 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let (subnet, server) = s.split_at(s.len() - 3);
        Some(Self {
            subnet: subnet.parse().ok()?,
            server: server.parse().ok()?,
        })
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03}", self.subnet, self.server)
    }
}
