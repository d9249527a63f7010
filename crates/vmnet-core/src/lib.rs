// vmnet-core: Config model, port expansion, address derivation, config store.
// No internal vmnet dependencies — this is the foundation crate.

pub mod addr;
pub mod config;
pub mod error;
pub mod ports;
pub mod store;

pub use config::{DedicatedIpv4, NetworkConfig, PortSpec, RouteConfig, SubnetConfig};
pub use error::ConfigError;
pub use ports::PortPair;
pub use store::ConfigStore;
