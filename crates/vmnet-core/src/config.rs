use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Root configuration snapshot: the declarative description of every subnet
/// and guest this host provides connectivity for.
///
/// Treated as a value — loaded once per activation or deactivation and never
/// mutated in place. Two snapshots can exist at the same time: the current
/// config and the last-activated one (deactivation must undo exactly what was
/// activated, even if the file changed in between).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub enabled: bool,
    #[serde(default)]
    pub subnets: BTreeMap<u8, SubnetConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subnets: BTreeMap::new(),
        }
    }
}

/// One hosted subnet. The subnet ID is the map key in [`NetworkConfig`];
/// the private ranges are always `192.168.{id}.0/24` and `fd00:{id}::/64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// Shared public IPv4 address for port-forwarded traffic.
    #[serde(rename = "publicIPv4")]
    pub public_ipv4: Ipv4Addr,
    /// Routed public IPv6 prefix, e.g. `"2001:db8:10"`.
    #[serde(rename = "publicIPv6Prefix")]
    pub public_ipv6_prefix: String,
    /// Interface carrying the subnet's outbound traffic.
    #[serde(rename = "uplinkIface")]
    pub uplink_iface: String,
    /// Bridge the guest taps are attached to.
    #[serde(rename = "bridgeIface")]
    pub bridge_iface: String,
    #[serde(default)]
    pub servers: BTreeMap<u8, RouteConfig>,
}

/// Per-guest connectivity. Every field is optional: an absent capability
/// installs nothing for that guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<DedicatedIpv4>,
    #[serde(default)]
    pub ipv6: bool,
    /// Extra public IPv6 addresses, one per suffix. Each entry must be a
    /// single hex digit appended to the server ID; invalid entries are
    /// skipped, not rejected.
    #[serde(rename = "extraIPv6Suffixes", default, skip_serializing_if = "Vec::is_empty")]
    pub extra_ipv6_suffixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
}

/// A dedicated public IPv4 address with its own uplink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedicatedIpv4 {
    pub addr: Ipv4Addr,
    #[serde(rename = "uplinkIface")]
    pub uplink_iface: String,
}

/// Declarative port mapping: a bare port, an inclusive `"start-end"` range,
/// or an explicit public/local pair whose sides are each port-or-range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Port(u16),
    Range(String),
    Pair {
        #[serde(rename = "pub")]
        public: PortOrRange,
        local: PortOrRange,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortOrRange {
    Port(u16),
    Range(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "enabled": true,
        "subnets": {
            "1": {
                "publicIPv4": "203.0.113.10",
                "publicIPv6Prefix": "2001:db8:10",
                "uplinkIface": "eth0",
                "bridgeIface": "vmbr1",
                "servers": {
                    "101": {
                        "ipv6": true,
                        "extraIPv6Suffixes": ["a", "b"],
                        "ports": [8080, "9000-9002", {"pub": 443, "local": 8443}]
                    },
                    "102": {
                        "ipv4": {"addr": "203.0.113.11", "uplinkIface": "eth1"}
                    }
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config: NetworkConfig = serde_json::from_str(SAMPLE).unwrap();
        assert!(config.enabled);
        let subnet = &config.subnets[&1];
        assert_eq!(subnet.public_ipv4.to_string(), "203.0.113.10");
        assert_eq!(subnet.bridge_iface, "vmbr1");

        let s101 = &subnet.servers[&101];
        assert!(s101.ipv6);
        assert!(s101.ipv4.is_none());
        assert_eq!(s101.extra_ipv6_suffixes, vec!["a", "b"]);
        assert_eq!(s101.ports.len(), 3);
        assert_eq!(s101.ports[0], PortSpec::Port(8080));
        assert_eq!(s101.ports[1], PortSpec::Range("9000-9002".to_string()));

        let s102 = &subnet.servers[&102];
        assert_eq!(s102.ipv4.as_ref().unwrap().uplink_iface, "eth1");
        assert!(!s102.ipv6);
        assert!(s102.ports.is_empty());
    }

    #[test]
    fn test_default_config_is_enabled_and_empty() {
        let config = NetworkConfig::default();
        assert!(config.enabled);
        assert!(config.subnets.is_empty());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config: NetworkConfig = serde_json::from_str(SAMPLE).unwrap();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.subnets.len(), 1);
        assert_eq!(parsed.subnets[&1].servers.len(), 2);
    }

    #[test]
    fn test_port_spec_pair_of_ranges() {
        let spec: PortSpec =
            serde_json::from_str(r#"{"pub": "9000-9002", "local": "9100-9102"}"#).unwrap();
        match spec {
            PortSpec::Pair { public, local } => {
                assert_eq!(public, PortOrRange::Range("9000-9002".to_string()));
                assert_eq!(local, PortOrRange::Range("9100-9102".to_string()));
            }
            other => panic!("expected pair, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(serde_json::from_str::<NetworkConfig>("{ not json").is_err());
    }
}
