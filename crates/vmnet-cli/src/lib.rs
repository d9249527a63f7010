// vmnet-cli: clap commands, logging init, process lifecycle.
// Depends on vmnet-core, vmnet-rules, vmnet-proxy, vmnet-service.

pub mod commands;
pub mod logging;

pub use commands::run;
