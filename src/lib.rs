//! # vmnet — private-network provisioning for multi-tenant VM hosts
//!
//! Facade crate that re-exports the vmnet workspace crates so consumers
//! can depend on a single `vmnet` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | `core` | vmnet-core | Config model, port expansion, addresses, store |
//! | `rules` | vmnet-rules | Command capability, rule lifecycle orchestrator |
//! | `proxy` | vmnet-proxy | Userspace TCP/UDP relay engine |
//! | `service` | vmnet-service | Running/stopped lifecycle coordinator |
//! | `cli` | vmnet-cli | Command dispatch and logging setup |

pub use vmnet_cli as cli;
pub use vmnet_core as core;
pub use vmnet_proxy as proxy;
pub use vmnet_rules as rules;
pub use vmnet_service as service;
