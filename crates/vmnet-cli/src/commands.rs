use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::logging::{self, LogFormat};

use vmnet_core::addr::{self, VmId};
use vmnet_core::store::ConfigStore;
use vmnet_proxy::RelaySettings;
use vmnet_rules::runner::HostRunner;
use vmnet_service::{Coordinator, ServiceState, StartOptions};

#[derive(Parser)]
#[command(
    name = "vmnetd",
    version,
    about = "Private-network provisioning for VM subnets: NAT/routing rules and userspace port relays"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the network service until interrupted, tearing down on exit
    Run {
        /// Forward ports through userspace TCP/UDP relays
        #[arg(long)]
        use_proxy: bool,
        /// Install netfilter/routing rules
        #[arg(long)]
        use_forwarding: bool,
        /// Evict idle UDP relay sessions after this many seconds
        #[arg(long, default_value_t = 60)]
        udp_idle_secs: u64,
    },
    /// Install rules for the current config and exit (rules persist)
    Up,
    /// Remove the rules of the last activated config and exit
    Down,
    /// Remove the last activated rules, then install the current config
    Reload,
    /// Show the derived addresses for a VM ID (subnet prefix + 3-digit server)
    Addr {
        /// Combined VM ID, e.g. 1101 for server 101 in subnet 1
        vmid: String,
    },
    /// Print the version
    Version,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // JSON logs in service mode, human-readable for one-shot commands.
    let log_format = match cli.command {
        Commands::Run { .. } => LogFormat::Json,
        _ => LogFormat::Human,
    };
    logging::init(log_format);

    match cli.command {
        Commands::Run {
            use_proxy,
            use_forwarding,
            udp_idle_secs,
        } => block_on(cmd_run(
            StartOptions {
                use_forwarding,
                use_proxy,
            },
            RelaySettings {
                idle_timeout: std::time::Duration::from_secs(udp_idle_secs),
            },
        )),
        Commands::Up => block_on(cmd_up()),
        Commands::Down => block_on(cmd_down()),
        Commands::Reload => block_on(async {
            cmd_down().await?;
            cmd_up().await
        }),
        Commands::Addr { vmid } => cmd_addr(&vmid),
        Commands::Version => {
            println!("vmnetd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Run a network command using the tokio runtime.
fn block_on<F>(f: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    runtime.block_on(f)
}

/// Service mode: bring the network up, hold it until ctrl-c, take it down.
/// Every exit path after the service is running goes through `stop`.
async fn cmd_run(opts: StartOptions, settings: RelaySettings) -> Result<()> {
    let store = ConfigStore::from_env();
    let runner = Arc::new(HostRunner::new());
    let mut coordinator = Coordinator::new(store, runner).with_relay_settings(settings);

    let outcome = async {
        coordinator.start(opts).await?;
        info!("Service running, press ctrl-c to stop");
        tokio::signal::ctrl_c()
            .await
            .with_context(|| "Failed to listen for ctrl-c")
    }
    .await;

    match outcome {
        Ok(()) => {
            info!("Shutdown signal received");
            coordinator.stop().await
        }
        Err(e) => {
            if coordinator.state() == ServiceState::Running {
                if let Err(stop_err) = coordinator.stop().await {
                    warn!(error = %stop_err, "Cleanup failed");
                }
            }
            Err(e)
        }
    }
}

/// Rule installation without a resident process.
const ONE_SHOT: StartOptions = StartOptions {
    use_forwarding: true,
    use_proxy: false,
};

/// One-shot activation: the installed rules outlive the process.
async fn cmd_up() -> Result<()> {
    let store = ConfigStore::from_env();
    let runner = Arc::new(HostRunner::new());
    let mut coordinator = Coordinator::new(store, runner);
    coordinator.start(ONE_SHOT).await?;
    info!("Network up");
    Ok(())
}

/// One-shot deactivation against the last activated snapshot, so edits made
/// since `up` do not leave rules behind.
async fn cmd_down() -> Result<()> {
    let store = ConfigStore::from_env();
    let runner = Arc::new(HostRunner::new());
    let mut coordinator = Coordinator::new(store, runner);
    coordinator.resume(ONE_SHOT);
    coordinator.stop().await?;
    info!("Network down");
    Ok(())
}

/// Print every address derived for one VM, public IPv6 included when the
/// config knows its subnet.
fn cmd_addr(vmid: &str) -> Result<()> {
    let id = VmId::parse(vmid).with_context(|| {
        format!("Invalid VM ID '{vmid}': expected 4-6 digits, last three are the server")
    })?;
    println!("vm:           {id}");
    println!("private ipv4: {}", addr::private_ipv4(id.subnet, id.server));

    let store = ConfigStore::from_env();
    let config = store.load().context("Failed to load config")?;
    match config.subnets.get(&id.subnet) {
        Some(subnet) => {
            let suffixes = subnet
                .servers
                .get(&id.server)
                .map(|route| route.extra_ipv6_suffixes.as_slice())
                .unwrap_or(&[]);
            for host in addr::ipv6_hosts(id.server, suffixes) {
                println!("private ipv6: {}", addr::private_ipv6(id.subnet, &host));
                println!(
                    "public ipv6:  {}",
                    addr::public_ipv6(&subnet.public_ipv6_prefix, id.subnet, &host)
                );
            }
        }
        None => {
            println!(
                "private ipv6: {}",
                addr::private_ipv6(id.subnet, &id.server.to_string())
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from(["vmnetd", "run", "--use-proxy", "--use-forwarding"]).unwrap();
        match cli.command {
            Commands::Run {
                use_proxy,
                use_forwarding,
                udp_idle_secs,
            } => {
                assert!(use_proxy);
                assert!(use_forwarding);
                assert_eq!(udp_idle_secs, 60);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_flags_default_off() {
        let cli = Cli::try_parse_from(["vmnetd", "run", "--udp-idle-secs", "5"]).unwrap();
        match cli.command {
            Commands::Run {
                use_proxy,
                use_forwarding,
                udp_idle_secs,
            } => {
                assert!(!use_proxy);
                assert!(!use_forwarding);
                assert_eq!(udp_idle_secs, 5);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_lifecycle_subcommands_parse() {
        for name in ["up", "down", "reload", "version"] {
            assert!(Cli::try_parse_from(["vmnetd", name]).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_addr_takes_a_vmid() {
        let cli = Cli::try_parse_from(["vmnetd", "addr", "1101"]).unwrap();
        match cli.command {
            Commands::Addr { vmid } => assert_eq!(vmid, "1101"),
            _ => panic!("expected addr"),
        }
        assert!(Cli::try_parse_from(["vmnetd", "addr"]).is_err());
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["vmnetd", "sideways"]).is_err());
    }
}
