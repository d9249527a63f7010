//! Relay engine: derives the set of TCP/UDP relays from a config snapshot
//! and runs them under one shutdown signal.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use vmnet_core::config::NetworkConfig;
use vmnet_core::{addr, ports};

use crate::tcp::TcpRelay;
use crate::udp::UdpRelay;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Eviction threshold for UDP sessions with no traffic in either
    /// direction.
    pub idle_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// One forwarded port pair: the subnet's public address on the public port
/// and the guest's private address on the local port. Each binding gets
/// both a TCP and a UDP relay. Listening on the public address keeps
/// subnets sharing a public port from colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayBinding {
    pub listen: SocketAddr,
    pub target: SocketAddr,
}

/// Derive the relay set from a snapshot. A guest whose port specs cannot be
/// expanded contributes no bindings; the rest of the fleet is unaffected.
pub fn bindings(config: &NetworkConfig) -> Vec<RelayBinding> {
    let mut out = Vec::new();
    for (&subnet_id, subnet) in &config.subnets {
        let public = IpAddr::V4(subnet.public_ipv4);
        for (&server_id, route) in &subnet.servers {
            if route.ports.is_empty() {
                continue;
            }
            let pairs = match ports::expand_all(&route.ports) {
                Ok(pairs) => pairs,
                Err(e) => {
                    error!(
                        subnet = subnet_id,
                        server = server_id,
                        error = %e,
                        "Unusable port mapping, no relays for this server"
                    );
                    continue;
                }
            };
            let vm = IpAddr::V4(addr::private_ipv4(subnet_id, server_id));
            for pair in pairs {
                out.push(RelayBinding {
                    listen: SocketAddr::new(public, pair.public),
                    target: SocketAddr::new(vm, pair.local),
                });
            }
        }
    }
    out
}

/// A running set of relays. Dropping the engine without calling
/// [`RelayEngine::shutdown`] leaves the relay tasks running detached.
pub struct RelayEngine {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    active: usize,
}

impl RelayEngine {
    /// Bind and start every relay the snapshot calls for. A port that cannot
    /// be bound is logged and skipped so one collision does not take down
    /// the rest of the fleet's forwarding.
    pub async fn start(config: &NetworkConfig, settings: RelaySettings) -> Result<Self> {
        let bindings = bindings(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        let mut active = 0;

        for binding in &bindings {
            match TcpRelay::bind(binding.listen, binding.target).await {
                Ok(relay) => {
                    handles.push(tokio::spawn(relay.run(shutdown_rx.clone())));
                    active += 1;
                }
                Err(e) => warn!(listen = %binding.listen, error = %e, "Skipping TCP relay"),
            }
            match UdpRelay::bind(binding.listen, binding.target, settings.idle_timeout).await {
                Ok(relay) => {
                    handles.push(tokio::spawn(relay.run(shutdown_rx.clone())));
                    active += 1;
                }
                Err(e) => warn!(listen = %binding.listen, error = %e, "Skipping UDP relay"),
            }
        }

        info!(
            bindings = bindings.len(),
            relays = active,
            "Relay engine started"
        );
        Ok(Self {
            shutdown_tx,
            handles,
            active,
        })
    }

    /// Number of relays actually listening (two per healthy binding).
    pub fn relay_count(&self) -> usize {
        self.active
    }

    /// Signal every relay to stop and wait for their accept loops to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("Relay engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use vmnet_core::config::{PortOrRange, PortSpec, RouteConfig, SubnetConfig};

    fn config_with_ports(ports: Vec<PortSpec>) -> NetworkConfig {
        let mut servers = BTreeMap::new();
        servers.insert(
            101,
            RouteConfig {
                ports,
                ..Default::default()
            },
        );
        let mut subnets = BTreeMap::new();
        subnets.insert(
            2,
            SubnetConfig {
                public_ipv4: "203.0.113.10".parse().unwrap(),
                public_ipv6_prefix: "2001:db8:10".to_string(),
                uplink_iface: "eth0".to_string(),
                bridge_iface: "vmbr2".to_string(),
                servers,
            },
        );
        NetworkConfig {
            enabled: true,
            subnets,
        }
    }

    #[test]
    fn test_bindings_expand_specs_against_private_addresses() {
        let config = config_with_ports(vec![
            PortSpec::Port(8080),
            PortSpec::Pair {
                public: PortOrRange::Port(443),
                local: PortOrRange::Port(8443),
            },
        ]);
        let derived = bindings(&config);

        assert_eq!(derived.len(), 2);
        assert_eq!(derived[0].listen.port(), 8080);
        assert_eq!(derived[0].target.to_string(), "192.168.2.101:8080");
        assert_eq!(derived[1].listen.port(), 443);
        assert_eq!(derived[1].target.to_string(), "192.168.2.101:8443");
    }

    #[test]
    fn test_bindings_listen_on_the_subnet_public_address() {
        let config = config_with_ports(vec![PortSpec::Port(8080)]);
        let derived = bindings(&config);

        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].listen.to_string(), "203.0.113.10:8080");
    }

    #[test]
    fn test_bindings_skip_unusable_servers() {
        let mut config = config_with_ports(vec![PortSpec::Port(8080)]);
        config.subnets.get_mut(&2).unwrap().servers.insert(
            102,
            RouteConfig {
                ports: vec![PortSpec::Pair {
                    public: PortOrRange::Range("9000-9002".to_string()),
                    local: PortOrRange::Range("9100-9101".to_string()),
                }],
                ..Default::default()
            },
        );
        let derived = bindings(&config);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].listen.port(), 8080);
    }

    #[test]
    fn test_bindings_empty_for_guests_without_ports() {
        let config = config_with_ports(Vec::new());
        assert!(bindings(&config).is_empty());
    }

    #[tokio::test]
    async fn test_engine_starts_and_stops_cleanly() {
        // No bindings: the engine starts empty and shuts down immediately.
        let config = config_with_ports(Vec::new());
        let engine = RelayEngine::start(&config, RelaySettings::default())
            .await
            .unwrap();
        assert_eq!(engine.relay_count(), 0);
        engine.shutdown().await;
    }
}
