//! Rule lifecycle orchestrator: derives the staged plan from a config
//! snapshot and applies or reverses it against the OS networking stack.
//!
//! Application is best-effort by default: a failing step is logged and its
//! siblings continue, favoring partial connectivity over total failure. In
//! strict mode the first failing stage rolls back everything already applied
//! and the pass fails.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use vmnet_core::config::NetworkConfig;

use crate::cmd::{self, RuleStep};
use crate::plan::{self, Stage};
use crate::runner::CommandRunner;

/// Failure policy for one activation or deactivation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplyMode {
    /// Log failures and continue with sibling operations.
    #[default]
    BestEffort,
    /// Roll back every already-applied step on the first failing stage.
    Strict,
}

/// Outcome of one pass.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: Vec<(String, String)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Add,
    Del,
}

pub struct Orchestrator<R> {
    runner: Arc<R>,
    mode: ApplyMode,
}

impl<R: CommandRunner> Orchestrator<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self {
            runner,
            mode: ApplyMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Install every rule the snapshot calls for.
    pub async fn activate(&self, config: &NetworkConfig) -> Result<ApplyReport> {
        let (stages, report) = self.build_stages(config).await;
        info!(
            stages = stages.len(),
            skipped = report.failed.len(),
            "Activating network rules"
        );
        self.apply(stages, Direction::Add, report).await
    }

    /// Remove every rule the snapshot calls for, in reverse structural order:
    /// server rules, subnet rules, chain jumps, chains, conntrack rules.
    pub async fn deactivate(&self, config: &NetworkConfig) -> Result<ApplyReport> {
        let (mut stages, report) = self.build_stages(config).await;
        stages.reverse();
        info!(stages = stages.len(), "Deactivating network rules");
        self.apply(stages, Direction::Del, report).await
    }

    /// Derive the full plan. Build-time failures (no gateway, unusable port
    /// mapping) drop only the affected server's steps and are pre-recorded
    /// in the report.
    async fn build_stages(&self, config: &NetworkConfig) -> (Vec<Stage>, ApplyReport) {
        let mut report = ApplyReport::default();
        let mut stages = vec![
            plan::conntrack_stage(),
            plan::chain_stage(),
            plan::jump_stage(),
            plan::subnet_stage(config),
        ];

        // One external gateway query per dedicated-IPv4 server; the servers
        // are independent, so the queries run concurrently.
        let mut lookups = JoinSet::new();
        for (&subnet_id, subnet) in &config.subnets {
            for (&server_id, route) in &subnet.servers {
                if let Some(dedicated) = &route.ipv4 {
                    let runner = Arc::clone(&self.runner);
                    let iface = dedicated.uplink_iface.clone();
                    lookups.spawn(async move {
                        let gateway = discover_gateway(runner.as_ref(), &iface).await;
                        ((subnet_id, server_id), gateway)
                    });
                }
            }
        }
        let mut gateways: HashMap<(u8, u8), Result<String>> = HashMap::new();
        while let Some(joined) = lookups.join_next().await {
            if let Ok((key, gateway)) = joined {
                gateways.insert(key, gateway);
            }
        }

        let mut server_steps = Vec::new();
        for (&subnet_id, subnet) in &config.subnets {
            for (&server_id, route) in &subnet.servers {
                if let Some(dedicated) = &route.ipv4 {
                    match gateways.remove(&(subnet_id, server_id)) {
                        Some(Ok(gateway)) => server_steps.extend(plan::server_ipv4_steps(
                            subnet_id, server_id, dedicated, &gateway,
                        )),
                        Some(Err(e)) => {
                            warn!(
                                subnet = subnet_id,
                                server = server_id,
                                iface = %dedicated.uplink_iface,
                                error = %e,
                                "No default gateway, skipping dedicated IPv4 setup"
                            );
                            report
                                .failed
                                .push((format!("server {subnet_id}.{server_id} ipv4"), e.to_string()));
                        }
                        None => {
                            report.failed.push((
                                format!("server {subnet_id}.{server_id} ipv4"),
                                "gateway lookup task failed".to_string(),
                            ));
                        }
                    }
                }
                if route.ipv6 {
                    server_steps.extend(plan::server_ipv6_steps(
                        subnet_id,
                        server_id,
                        subnet,
                        &route.extra_ipv6_suffixes,
                    ));
                }
                if !route.ports.is_empty() {
                    match plan::server_port_steps(subnet_id, server_id, subnet, &route.ports) {
                        Ok(steps) => server_steps.extend(steps),
                        Err(e) => {
                            error!(
                                subnet = subnet_id,
                                server = server_id,
                                error = %e,
                                "Unusable port mapping, skipping port setup"
                            );
                            report
                                .failed
                                .push((format!("server {subnet_id}.{server_id} ports"), e.to_string()));
                        }
                    }
                }
            }
        }
        stages.push(Stage {
            name: "server rules",
            steps: server_steps,
        });
        (stages, report)
    }

    /// Execute the plan stage by stage. Steps within a stage are independent
    /// and run concurrently; every step of a stage completes before the next
    /// stage starts.
    async fn apply(
        &self,
        stages: Vec<Stage>,
        direction: Direction,
        mut report: ApplyReport,
    ) -> Result<ApplyReport> {
        let mut undo: Vec<RuleStep> = Vec::new();

        for stage in stages {
            let mut set = JoinSet::new();
            for step in stage.steps {
                let runner = Arc::clone(&self.runner);
                set.spawn(async move {
                    let cmds = match direction {
                        Direction::Add => &step.add,
                        Direction::Del => &step.del,
                    };
                    for command in cmds {
                        if let Err(e) = runner.run(command).await {
                            return (step, Some(e.to_string()));
                        }
                    }
                    (step, None)
                });
            }

            let mut stage_failed = false;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((step, None)) => {
                        report.applied += 1;
                        undo.push(step);
                    }
                    Ok((step, Some(e))) => {
                        warn!(step = %step.label, error = %e, "Rule step failed");
                        report.failed.push((step.label, e));
                        stage_failed = true;
                    }
                    Err(e) => {
                        report.failed.push((stage.name.to_string(), e.to_string()));
                        stage_failed = true;
                    }
                }
            }

            if stage_failed && self.mode == ApplyMode::Strict && direction == Direction::Add {
                let rolled_back = undo.len();
                self.rollback(undo).await;
                bail!(
                    "stage '{}' failed in strict mode, rolled back {} applied steps",
                    stage.name,
                    rolled_back
                );
            }
        }

        info!(
            applied = report.applied,
            failed = report.failed.len(),
            "Rule pass complete"
        );
        Ok(report)
    }

    async fn rollback(&self, applied: Vec<RuleStep>) {
        for step in applied.iter().rev() {
            for command in &step.del {
                if let Err(e) = self.runner.run(command).await {
                    warn!(step = %step.label, error = %e, "Rollback step failed");
                }
            }
        }
    }

}

/// Discover the current default gateway on an uplink interface.
async fn discover_gateway<R: CommandRunner>(runner: &R, iface: &str) -> Result<String> {
    let out = runner.capture(&cmd::default_gateway_query(iface)).await?;
    let mut tokens = out.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "via" {
            if let Some(gateway) = tokens.next() {
                return Ok(gateway.to_string());
            }
        }
    }
    bail!("no default gateway on interface {iface}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use vmnet_core::config::{
        DedicatedIpv4, PortOrRange, PortSpec, RouteConfig, SubnetConfig,
    };

    use crate::runner::RecordingRunner;

    fn full_config() -> NetworkConfig {
        let mut servers = BTreeMap::new();
        servers.insert(
            101,
            RouteConfig {
                ipv6: true,
                extra_ipv6_suffixes: vec!["a".to_string()],
                ports: vec![PortSpec::Port(8080)],
                ..Default::default()
            },
        );
        servers.insert(
            102,
            RouteConfig {
                ipv4: Some(DedicatedIpv4 {
                    addr: "203.0.113.11".parse().unwrap(),
                    uplink_iface: "eth1".to_string(),
                }),
                ..Default::default()
            },
        );

        let mut subnets = BTreeMap::new();
        subnets.insert(
            1,
            SubnetConfig {
                public_ipv4: "203.0.113.10".parse().unwrap(),
                public_ipv6_prefix: "2001:db8:10".to_string(),
                uplink_iface: "eth0".to_string(),
                bridge_iface: "vmbr1".to_string(),
                servers,
            },
        );
        NetworkConfig {
            enabled: true,
            subnets,
        }
    }

    fn runner_with_gateway() -> Arc<RecordingRunner> {
        let runner = Arc::new(RecordingRunner::new());
        runner.script_capture(
            "route show default dev eth1",
            "default via 198.51.100.1 dev eth1 proto dhcp",
        );
        runner
    }

    /// Commands that install state, as opposed to queries.
    fn adds(log: &[String]) -> Vec<String> {
        log.iter()
            .filter(|c| c.contains(" -A ") || c.contains(" -I ") || c.contains(" -N ")
                || c.contains(" add "))
            .cloned()
            .collect()
    }

    fn removes(log: &[String]) -> Vec<String> {
        log.iter()
            .filter(|c| c.contains(" -D ") || c.contains(" -F ") || c.contains(" -X ")
                || c.contains(" del "))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_activate_then_deactivate_is_symmetric() {
        let config = full_config();
        let runner = runner_with_gateway();
        let orchestrator = Orchestrator::new(Arc::clone(&runner));

        let report = orchestrator.activate(&config).await.unwrap();
        assert!(report.is_clean(), "activation failed: {:?}", report.failed);
        let activate_log = runner.rendered();

        let runner2 = runner_with_gateway();
        let orchestrator2 = Orchestrator::new(Arc::clone(&runner2));
        let report = orchestrator2.deactivate(&config).await.unwrap();
        assert!(report.is_clean());
        let deactivate_log = runner2.rendered();

        // Every appended/inserted rule has exactly one matching delete.
        for add in &activate_log {
            if let Some(del) = add
                .contains(" -A ")
                .then(|| add.replacen(" -A ", " -D ", 1))
                .or_else(|| add.contains(" -I ").then(|| add.replacen(" -I ", " -D ", 1)))
            {
                assert_eq!(
                    deactivate_log.iter().filter(|c| **c == del).count(),
                    1,
                    "no matching remove for '{}'",
                    add
                );
            }
        }
        // Chains are flushed and deleted; ip add operations have del twins.
        for chain in [plan::FORWARD_CHAIN, plan::PREROUTING_CHAIN] {
            assert!(activate_log.iter().any(|c| c.ends_with(&format!("-N {chain}"))));
            assert!(deactivate_log.iter().any(|c| c.ends_with(&format!("-F {chain}"))));
            assert!(deactivate_log.iter().any(|c| c.ends_with(&format!("-X {chain}"))));
        }
        assert_eq!(
            adds(&activate_log).len(),
            // -N becomes -F plus -X; ip route del drops the via argument but
            // still counts once.
            removes(&deactivate_log).len() - 2,
        );
    }

    #[tokio::test]
    async fn test_chains_created_before_jumps_and_removed_after() {
        let config = full_config();
        let runner = runner_with_gateway();
        Orchestrator::new(Arc::clone(&runner))
            .activate(&config)
            .await
            .unwrap();
        let log = runner.rendered();

        let chain_pos = log
            .iter()
            .position(|c| c.ends_with(&format!("-N {}", plan::FORWARD_CHAIN)))
            .unwrap();
        let jump_pos = log
            .iter()
            .position(|c| c.contains(&format!("-I FORWARD -j {}", plan::FORWARD_CHAIN)))
            .unwrap();
        assert!(chain_pos < jump_pos, "chain must exist before its jump");

        let runner = runner_with_gateway();
        Orchestrator::new(Arc::clone(&runner))
            .deactivate(&config)
            .await
            .unwrap();
        let log = runner.rendered();

        let jump_del = log
            .iter()
            .position(|c| c.contains(&format!("-D FORWARD -j {}", plan::FORWARD_CHAIN)))
            .unwrap();
        let chain_del = log
            .iter()
            .position(|c| c.ends_with(&format!("-X {}", plan::FORWARD_CHAIN)))
            .unwrap();
        assert!(jump_del < chain_del, "jump must be removed before its chain");
    }

    #[tokio::test]
    async fn test_best_effort_continues_past_failures() {
        let config = full_config();
        let runner = runner_with_gateway();
        runner.fail_matching("-j CT --zone 1");

        let report = Orchestrator::new(Arc::clone(&runner))
            .activate(&config)
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 2, "both conntrack rules fail");
        assert!(report.applied > 0);
        // Later stages still ran.
        assert!(runner.rendered().iter().any(|c| c.contains("-j MASQUERADE")));
    }

    #[tokio::test]
    async fn test_strict_mode_rolls_back_on_failure() {
        let config = full_config();
        let runner = runner_with_gateway();
        runner.fail_matching("-I FORWARD -j VMNET-FORWARD");

        let err = Orchestrator::new(Arc::clone(&runner))
            .with_mode(ApplyMode::Strict)
            .activate(&config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("strict mode"));

        // The chains created before the failing jump stage were rolled back.
        let log = runner.rendered();
        assert!(log.iter().any(|c| c.ends_with("-X VMNET-FORWARD")));
        assert!(log.iter().any(|c| c.ends_with("-X VMNET-PREROUTING")));
        // Nothing past the failing stage was applied.
        assert!(!log.iter().any(|c| c.contains("-j MASQUERADE")));
    }

    #[tokio::test]
    async fn test_gateway_failure_skips_only_that_server() {
        let mut config = full_config();
        // Second dedicated-IPv4 server on an uplink with no scripted gateway.
        config.subnets.get_mut(&1).unwrap().servers.insert(
            103,
            RouteConfig {
                ipv4: Some(DedicatedIpv4 {
                    addr: "203.0.113.12".parse().unwrap(),
                    uplink_iface: "eth2".to_string(),
                }),
                ..Default::default()
            },
        );

        let runner = runner_with_gateway();
        let report = Orchestrator::new(Arc::clone(&runner))
            .activate(&config)
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.contains("1.103 ipv4"));

        let log = runner.rendered();
        assert!(log.iter().any(|c| c.contains("lookup 80061102")));
        assert!(!log.iter().any(|c| c.contains("lookup 80061103")));
        assert!(!log.iter().any(|c| c.contains("203.0.113.12")));
    }

    #[tokio::test]
    async fn test_each_dedicated_server_uses_its_own_gateway() {
        let mut config = full_config();
        config.subnets.get_mut(&1).unwrap().servers.insert(
            103,
            RouteConfig {
                ipv4: Some(DedicatedIpv4 {
                    addr: "203.0.113.12".parse().unwrap(),
                    uplink_iface: "eth2".to_string(),
                }),
                ..Default::default()
            },
        );

        let runner = runner_with_gateway();
        runner.script_capture(
            "route show default dev eth2",
            "default via 198.51.100.254 dev eth2",
        );

        let report = Orchestrator::new(Arc::clone(&runner))
            .activate(&config)
            .await
            .unwrap();
        assert!(report.is_clean(), "activation failed: {:?}", report.failed);

        let log = runner.rendered();
        assert!(log.iter().any(|c| c
            == "ip route add default via 198.51.100.1 dev eth1 table 80061102"));
        assert!(log.iter().any(|c| c
            == "ip route add default via 198.51.100.254 dev eth2 table 80061103"));
    }

    #[tokio::test]
    async fn test_port_mismatch_skips_only_that_server() {
        let mut config = full_config();
        config.subnets.get_mut(&1).unwrap().servers.insert(
            104,
            RouteConfig {
                ports: vec![PortSpec::Pair {
                    public: PortOrRange::Range("9000-9002".to_string()),
                    local: PortOrRange::Range("9100-9101".to_string()),
                }],
                ..Default::default()
            },
        );

        let runner = runner_with_gateway();
        let report = Orchestrator::new(Arc::clone(&runner))
            .activate(&config)
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.contains("1.104 ports"));

        let log = runner.rendered();
        // No command at all for the misconfigured server, before or after.
        assert!(!log.iter().any(|c| c.contains("192.168.1.104")));
        // The sibling server's port rules went in.
        assert!(log.iter().any(|c| c.contains("192.168.1.101:8080")));
    }

    #[tokio::test]
    async fn test_absent_capabilities_install_nothing() {
        let mut config = full_config();
        let subnet = config.subnets.get_mut(&1).unwrap();
        subnet.servers.clear();
        subnet.servers.insert(105, RouteConfig::default());

        let runner = Arc::new(RecordingRunner::new());
        let report = Orchestrator::new(Arc::clone(&runner))
            .activate(&config)
            .await
            .unwrap();

        assert!(report.is_clean());
        assert!(!runner.rendered().iter().any(|c| c.contains("192.168.1.105")));
    }
}
