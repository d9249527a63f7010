//! Structured command descriptions for the OS networking surface.
//!
//! Every external invocation is a program plus an argument vector — never a
//! concatenated shell string — built by one small constructor per rule
//! category. Constructors produce [`RuleStep`]s pairing the command(s) that
//! install a rule with the command(s) that remove it, so activation and
//! deactivation stay symmetric by construction.

use std::fmt;

/// One external OS command: program and argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl Cmd {
    pub fn new<I, S>(program: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Address family, selecting the iptables binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn program(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// Netfilter table a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
    Raw,
}

impl Table {
    /// `filter` is the default table and takes no `-t` argument.
    fn flag(self) -> Option<&'static str> {
        match self {
            Table::Filter => None,
            Table::Nat => Some("nat"),
            Table::Raw => Some("raw"),
        }
    }
}

/// A reversible rule operation: the commands that install it paired with the
/// commands that remove it.
#[derive(Debug, Clone)]
pub struct RuleStep {
    pub label: String,
    pub add: Vec<Cmd>,
    pub del: Vec<Cmd>,
}

fn iptables(family: Family, table: Table, flag: &str, chain: &str, spec: &[&str]) -> Cmd {
    let mut args: Vec<String> = Vec::with_capacity(spec.len() + 4);
    if let Some(t) = table.flag() {
        args.push("-t".into());
        args.push(t.into());
    }
    args.push(flag.into());
    args.push(chain.into());
    args.extend(spec.iter().map(|s| s.to_string()));
    Cmd {
        program: family.program(),
        args,
    }
}

/// Appended rule: `-A` on install, `-D` on removal.
pub fn rule(label: String, family: Family, table: Table, chain: &str, spec: &[&str]) -> RuleStep {
    RuleStep {
        label,
        add: vec![iptables(family, table, "-A", chain, spec)],
        del: vec![iptables(family, table, "-D", chain, spec)],
    }
}

/// Inserted rule (front of chain): `-I` on install, `-D` on removal.
/// Used for chain jumps and the conntrack-zone rules, which must win over
/// pre-existing rules.
pub fn rule_insert(
    label: String,
    family: Family,
    table: Table,
    chain: &str,
    spec: &[&str],
) -> RuleStep {
    RuleStep {
        label,
        add: vec![iptables(family, table, "-I", chain, spec)],
        del: vec![iptables(family, table, "-D", chain, spec)],
    }
}

/// Custom chain: created with `-N`; removal flushes then deletes. The flush
/// must precede the delete, and every jump into the chain must already be
/// gone or the delete fails.
pub fn chain(label: String, family: Family, table: Table, name: &str) -> RuleStep {
    RuleStep {
        label,
        add: vec![iptables(family, table, "-N", name, &[])],
        del: vec![
            iptables(family, table, "-F", name, &[]),
            iptables(family, table, "-X", name, &[]),
        ],
    }
}

/// Interface address assignment (`ip addr add`/`del`).
pub fn address(label: String, addr: &str, dev: &str) -> RuleStep {
    RuleStep {
        label,
        add: vec![Cmd::new("ip", ["addr", "add", addr, "dev", dev])],
        del: vec![Cmd::new("ip", ["addr", "del", addr, "dev", dev])],
    }
}

/// Policy-routing source rule (`ip rule`): traffic from the VM's private
/// address is looked up in its dedicated table.
pub fn policy_rule(label: String, from: &str, table_id: &str) -> RuleStep {
    RuleStep {
        label,
        add: vec![Cmd::new("ip", ["rule", "add", "from", from, "lookup", table_id])],
        del: vec![Cmd::new("ip", ["rule", "del", "from", from, "lookup", table_id])],
    }
}

/// Dedicated default route in the VM's routing table. Removal does not need
/// the gateway, only the device and table.
pub fn policy_route(label: String, gateway: &str, dev: &str, table_id: &str) -> RuleStep {
    RuleStep {
        label,
        add: vec![Cmd::new(
            "ip",
            ["route", "add", "default", "via", gateway, "dev", dev, "table", table_id],
        )],
        del: vec![Cmd::new(
            "ip",
            ["route", "del", "default", "dev", dev, "table", table_id],
        )],
    }
}

/// Query the current default gateway on an uplink interface.
pub fn default_gateway_query(dev: &str) -> Cmd {
    Cmd::new("ip", ["-4", "route", "show", "default", "dev", dev])
}

/// One-shot kernel settings required before any forwarding rule can work.
pub fn forwarding_sysctls() -> Vec<Cmd> {
    [
        "net.ipv4.ip_forward=1",
        "net.ipv4.conf.all.proxy_arp=1",
        "net.ipv6.conf.all.forwarding=1",
        "net.ipv6.conf.all.proxy_ndp=1",
    ]
    .into_iter()
    .map(|kv| Cmd::new("sysctl", ["-w", kv]))
    .collect()
}

/// Policy-routing table ID for a VM, derived from its subnet and server IDs.
pub fn routing_table_id(subnet: u8, server: u8) -> String {
    format!("8006{subnet}{server}")
}
