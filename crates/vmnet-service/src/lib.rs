//! Service coordinator: the running/stopped state machine that sequences the
//! config store, kernel prerequisites, rule orchestrator, and relay engine.
//!
//! The coordinator snapshots the config at start so that stop undoes exactly
//! what start installed, even if `config.json` changed in between. `stop` is
//! the single cancellation path and always leaves the service stopped, no
//! matter how far start got.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use vmnet_core::config::NetworkConfig;
use vmnet_core::store::ConfigStore;
use vmnet_proxy::{RelayEngine, RelaySettings};
use vmnet_rules::orchestrator::Orchestrator;
use vmnet_rules::runner::CommandRunner;
use vmnet_rules::{cmd, plan};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServiceState {
    #[default]
    Stopped,
    Running,
}

/// Which connectivity mechanisms the service drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Install netfilter/routing rules via the orchestrator.
    pub use_forwarding: bool,
    /// Run userspace TCP/UDP relays for the forwarded ports.
    pub use_proxy: bool,
}

pub struct Coordinator<R> {
    store: ConfigStore,
    runner: Arc<R>,
    settings: RelaySettings,
    state: ServiceState,
    opts: StartOptions,
    engine: Option<RelayEngine>,
    activated: Option<NetworkConfig>,
}

impl<R: CommandRunner> Coordinator<R> {
    pub fn new(store: ConfigStore, runner: Arc<R>) -> Self {
        Self {
            store,
            runner,
            settings: RelaySettings::default(),
            state: ServiceState::default(),
            opts: StartOptions::default(),
            engine: None,
            activated: None,
        }
    }

    pub fn with_relay_settings(mut self, settings: RelaySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Bring the service up. A second start while running is a no-op.
    ///
    /// The config is loaded and snapshotted first; the service counts as
    /// running from that point even if rule application only partially
    /// succeeds, so that `stop` can undo the partial state.
    pub async fn start(&mut self, opts: StartOptions) -> Result<()> {
        if self.state == ServiceState::Running {
            info!("Service already running");
            return Ok(());
        }

        let config = self.store.load().context("Failed to load config")?;
        self.store
            .snapshot()
            .context("Failed to snapshot config")?;
        self.state = ServiceState::Running;
        self.opts = opts;
        self.activated = Some(config.clone());

        if !config.enabled {
            info!("Networking disabled in config, nothing to install");
            return Ok(());
        }

        apply_sysctls(self.runner.as_ref()).await;

        if opts.use_forwarding {
            let report = Orchestrator::new(Arc::clone(&self.runner))
                .activate(&config)
                .await?;
            if !report.is_clean() {
                warn!(failed = report.failed.len(), "Partial rule activation");
            }
        }
        if opts.use_proxy {
            self.relay_firewall(&config, true).await;
            self.engine = Some(RelayEngine::start(&config, self.settings).await?);
        }

        info!(
            subnets = config.subnets.len(),
            forwarding = opts.use_forwarding,
            proxy = opts.use_proxy,
            "Service started"
        );
        Ok(())
    }

    /// Adopt network state installed by a previous process, so that `stop`
    /// undoes it. Used by one-shot teardown: rules outlive the process that
    /// installed them, and the config they came from is recovered from the
    /// last-activated snapshot file.
    pub fn resume(&mut self, opts: StartOptions) {
        self.state = ServiceState::Running;
        self.opts = opts;
    }

    /// Take the service down. A stop while stopped is a no-op.
    ///
    /// Undoes forwarding against the config that was actually activated (the
    /// in-memory copy, or the snapshot file after a restart) and stops the
    /// relay engine. The service is stopped from the moment this is called.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == ServiceState::Stopped {
            info!("Service already stopped");
            return Ok(());
        }
        self.state = ServiceState::Stopped;

        if let Some(engine) = self.engine.take() {
            engine.shutdown().await;
        }

        let config = match self.activated.take() {
            Some(config) => config,
            None => self
                .store
                .load_last_activated()
                .context("Failed to load last-activated config")?,
        };

        if self.opts.use_proxy && config.enabled {
            self.relay_firewall(&config, false).await;
        }

        if self.opts.use_forwarding && config.enabled {
            let report = Orchestrator::new(Arc::clone(&self.runner))
                .deactivate(&config)
                .await?;
            if !report.is_clean() {
                warn!(failed = report.failed.len(), "Partial rule removal");
            }
        }

        info!("Service stopped");
        Ok(())
    }

    /// Open or close the host-firewall accept rules for relayed ports. The
    /// relay terminates connections on the host itself, so INPUT/OUTPUT must
    /// accept them. Best-effort, like the sysctls: a failed rule is logged
    /// and the rest still apply.
    async fn relay_firewall(&self, config: &NetworkConfig, open: bool) {
        for (&subnet_id, subnet) in &config.subnets {
            for (&server_id, route) in &subnet.servers {
                if route.ports.is_empty() {
                    continue;
                }
                let steps =
                    match plan::relay_accept_steps(subnet_id, server_id, subnet, &route.ports) {
                        Ok(steps) => steps,
                        Err(e) => {
                            warn!(
                                subnet = subnet_id,
                                server = server_id,
                                error = %e,
                                "Skipping relay firewall rules"
                            );
                            continue;
                        }
                    };
                if open {
                    for step in &steps {
                        for command in &step.add {
                            if let Err(e) = self.runner.run(command).await {
                                warn!(step = %step.label, error = %e, "Relay firewall rule failed");
                            }
                        }
                    }
                } else {
                    for step in steps.iter().rev() {
                        for command in &step.del {
                            if let Err(e) = self.runner.run(command).await {
                                warn!(step = %step.label, error = %e, "Relay firewall removal failed");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Kernel forwarding/proxy-ARP settings every rule depends on. Host-wide and
/// best-effort: a failure is logged, not fatal, and they are not reverted on
/// stop.
pub async fn apply_sysctls<R: CommandRunner>(runner: &R) {
    for command in cmd::forwarding_sysctls() {
        if let Err(e) = runner.run(&command).await {
            warn!(command = %command, error = %e, "Sysctl failed");
        }
    }
}
