//! Derivation of the staged rule plan from a config snapshot.
//!
//! The plan is deterministic: the same snapshot always yields the same
//! stages, which is what makes activation idempotent and deactivation exact
//! without persisting any rule state.
//!
//! Stage order is a dependency order — chains before jumps into them,
//! scaffolding before per-subnet rules, subnets before servers. Steps within
//! one stage touch disjoint rule sets and may run concurrently.

use vmnet_core::config::{DedicatedIpv4, NetworkConfig, PortSpec, SubnetConfig};
use vmnet_core::error::ConfigError;
use vmnet_core::{addr, ports};

use crate::cmd::{self, Family, RuleStep, Table};

/// Custom filter chain holding the per-port accept rules.
pub const FORWARD_CHAIN: &str = "VMNET-FORWARD";
/// Custom nat chain holding the DNAT rules, jumped to from PREROUTING and
/// OUTPUT.
pub const PREROUTING_CHAIN: &str = "VMNET-PREROUTING";

/// One ordered phase of the plan.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: &'static str,
    pub steps: Vec<RuleStep>,
}

/// Conntrack-zone rules for the firewall-bridge interface pattern, in the
/// raw table so they run before connection tracking.
pub fn conntrack_stage() -> Stage {
    let steps = [Family::V4, Family::V6]
        .into_iter()
        .map(|family| {
            cmd::rule_insert(
                format!("conntrack zone ({:?})", family),
                family,
                Table::Raw,
                "PREROUTING",
                &["-i", "fwbr+", "-j", "CT", "--zone", "1"],
            )
        })
        .collect();
    Stage {
        name: "conntrack zone",
        steps,
    }
}

pub fn chain_stage() -> Stage {
    Stage {
        name: "chains",
        steps: vec![
            cmd::chain(
                format!("chain {FORWARD_CHAIN}"),
                Family::V4,
                Table::Filter,
                FORWARD_CHAIN,
            ),
            cmd::chain(
                format!("chain {PREROUTING_CHAIN}"),
                Family::V4,
                Table::Nat,
                PREROUTING_CHAIN,
            ),
        ],
    }
}

pub fn jump_stage() -> Stage {
    Stage {
        name: "chain jumps",
        steps: vec![
            cmd::rule_insert(
                format!("jump FORWARD -> {FORWARD_CHAIN}"),
                Family::V4,
                Table::Filter,
                "FORWARD",
                &["-j", FORWARD_CHAIN],
            ),
            cmd::rule_insert(
                format!("jump PREROUTING -> {PREROUTING_CHAIN}"),
                Family::V4,
                Table::Nat,
                "PREROUTING",
                &["-j", PREROUTING_CHAIN],
            ),
            cmd::rule_insert(
                format!("jump OUTPUT -> {PREROUTING_CHAIN}"),
                Family::V4,
                Table::Nat,
                "OUTPUT",
                &["-j", PREROUTING_CHAIN],
            ),
        ],
    }
}

/// Per-subnet rules: outbound masquerade on the uplink plus the bridge-side
/// forwarding policy. Subnets are independent of each other.
pub fn subnet_stage(config: &NetworkConfig) -> Stage {
    let mut steps = Vec::new();
    for (&id, subnet) in &config.subnets {
        let v4_subnet = addr::private_ipv4_subnet(id);
        let v6_subnet = addr::private_ipv6_subnet(id);
        let uplink = subnet.uplink_iface.as_str();
        let bridge = subnet.bridge_iface.as_str();

        steps.push(cmd::rule(
            format!("subnet {id} ipv4 masquerade"),
            Family::V4,
            Table::Nat,
            "POSTROUTING",
            &["-s", &v4_subnet, "-o", uplink, "-j", "MASQUERADE"],
        ));
        steps.push(cmd::rule(
            format!("subnet {id} ipv6 masquerade"),
            Family::V6,
            Table::Nat,
            "POSTROUTING",
            &["-s", &v6_subnet, "-o", uplink, "-j", "MASQUERADE"],
        ));
        steps.push(cmd::rule(
            format!("subnet {id} established accept"),
            Family::V4,
            Table::Filter,
            "FORWARD",
            &[
                "-o",
                bridge,
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        ));
        steps.push(cmd::rule(
            format!("subnet {id} intra-bridge accept"),
            Family::V4,
            Table::Filter,
            "FORWARD",
            &["-i", bridge, "-o", bridge, "-j", "ACCEPT"],
        ));
        steps.push(cmd::rule(
            format!("subnet {id} bridge filter"),
            Family::V4,
            Table::Filter,
            "FORWARD",
            &["-o", bridge, "-j", FORWARD_CHAIN],
        ));
    }
    Stage {
        name: "subnet rules",
        steps,
    }
}

/// Dedicated-IPv4 steps for one server: masquerade out the dedicated uplink,
/// policy routing so return traffic uses that uplink's gateway, and DNAT of
/// the dedicated public address to the VM.
pub fn server_ipv4_steps(
    subnet_id: u8,
    server_id: u8,
    dedicated: &DedicatedIpv4,
    gateway: &str,
) -> Vec<RuleStep> {
    let vm = addr::private_ipv4(subnet_id, server_id).to_string();
    let public = dedicated.addr.to_string();
    let uplink = dedicated.uplink_iface.as_str();
    let table_id = cmd::routing_table_id(subnet_id, server_id);
    let tag = format!("server {subnet_id}.{server_id}");

    let mut steps = vec![
        cmd::rule(
            format!("{tag} dedicated masquerade"),
            Family::V4,
            Table::Nat,
            "POSTROUTING",
            &["-s", &vm, "-o", uplink, "-j", "MASQUERADE"],
        ),
        cmd::policy_rule(format!("{tag} policy rule"), &vm, &table_id),
        cmd::policy_route(format!("{tag} policy route"), gateway, uplink, &table_id),
    ];
    for proto in ["tcp", "udp"] {
        steps.push(cmd::rule(
            format!("{tag} dedicated dnat {proto}"),
            Family::V4,
            Table::Nat,
            PREROUTING_CHAIN,
            &["-d", &public, "-p", proto, "-j", "DNAT", "--to-destination", &vm],
        ));
    }
    steps
}

/// IPv6 steps for one server: assign each public address to the bridge and
/// DNAT it to the VM's private address. The base server ID and every valid
/// extra suffix each yield an independent address/DNAT set.
pub fn server_ipv6_steps(
    subnet_id: u8,
    server_id: u8,
    subnet: &SubnetConfig,
    extra_suffixes: &[String],
) -> Vec<RuleStep> {
    let tag = format!("server {subnet_id}.{server_id}");
    let mut steps = Vec::new();
    for host in addr::ipv6_hosts(server_id, extra_suffixes) {
        let public = addr::public_ipv6(&subnet.public_ipv6_prefix, subnet_id, &host);
        let private = addr::private_ipv6(subnet_id, &host);

        steps.push(cmd::address(
            format!("{tag} ipv6 address ::{host}"),
            &public,
            &subnet.bridge_iface,
        ));
        for proto in ["tcp", "udp"] {
            steps.push(cmd::rule(
                format!("{tag} ipv6 dnat ::{host} {proto}"),
                Family::V6,
                Table::Nat,
                "PREROUTING",
                &[
                    "-d",
                    &public,
                    "-i",
                    &subnet.uplink_iface,
                    "-p",
                    proto,
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &private,
                ],
            ));
        }
    }
    steps
}

/// Port-forwarding steps for one server. Fails before producing any step
/// when a spec cannot be expanded — an unusable mapping must not be half
/// installed.
pub fn server_port_steps(
    subnet_id: u8,
    server_id: u8,
    subnet: &SubnetConfig,
    specs: &[PortSpec],
) -> Result<Vec<RuleStep>, ConfigError> {
    let pairs = ports::expand_all(specs)?;
    let vm = addr::private_ipv4(subnet_id, server_id).to_string();
    let v4_subnet = addr::private_ipv4_subnet(subnet_id);
    let public_addr = subnet.public_ipv4.to_string();
    let tag = format!("server {subnet_id}.{server_id}");

    let mut steps = Vec::new();
    for pair in pairs {
        let public_port = pair.public.to_string();
        let local_port = pair.local.to_string();
        let dnat_target = format!("{vm}:{}", pair.local);

        for proto in ["tcp", "udp"] {
            steps.push(cmd::rule(
                format!("{tag} port {public_port}->{local_port} accept {proto}"),
                Family::V4,
                Table::Filter,
                FORWARD_CHAIN,
                &["-d", &vm, "-p", proto, "--dport", &local_port, "-j", "ACCEPT"],
            ));
            steps.push(cmd::rule(
                format!("{tag} port {public_port}->{local_port} reflect {proto}"),
                Family::V4,
                Table::Nat,
                "POSTROUTING",
                &[
                    "-s",
                    &v4_subnet,
                    "-d",
                    &vm,
                    "-p",
                    proto,
                    "--dport",
                    &local_port,
                    "-j",
                    "MASQUERADE",
                ],
            ));
            steps.push(cmd::rule(
                format!("{tag} port {public_port}->{local_port} dnat {proto}"),
                Family::V4,
                Table::Nat,
                PREROUTING_CHAIN,
                &[
                    "-d",
                    &public_addr,
                    "-p",
                    proto,
                    "--dport",
                    &public_port,
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &dnat_target,
                ],
            ));
        }
    }
    Ok(steps)
}

/// Host-firewall accept rules for the ports a userspace relay serves: inbound
/// traffic to the subnet's public address on the public port range, and the
/// relay's replies from that range. Needed only when forwarding runs through
/// the relay, since those connections terminate on the host instead of being
/// DNATed past it. One rule covers a whole range.
pub fn relay_accept_steps(
    subnet_id: u8,
    server_id: u8,
    subnet: &SubnetConfig,
    specs: &[PortSpec],
) -> Result<Vec<RuleStep>, ConfigError> {
    let public_addr = subnet.public_ipv4.to_string();
    let tag = format!("server {subnet_id}.{server_id}");

    let mut steps = Vec::new();
    for spec in specs {
        let range = spec.public_port_expr()?;
        steps.push(cmd::rule(
            format!("{tag} relay accept in {range}"),
            Family::V4,
            Table::Filter,
            "INPUT",
            &[
                "-p",
                "tcp",
                "-d",
                &public_addr,
                "--dport",
                &range,
                "-m",
                "conntrack",
                "--ctstate",
                "NEW,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        ));
        steps.push(cmd::rule(
            format!("{tag} relay accept out {range}"),
            Family::V4,
            Table::Filter,
            "OUTPUT",
            &[
                "-p",
                "tcp",
                "--sport",
                &range,
                "-m",
                "conntrack",
                "--ctstate",
                "ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        ));
    }
    Ok(steps)
}
