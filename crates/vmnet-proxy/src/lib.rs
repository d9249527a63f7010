// vmnet-proxy: userspace L4 relays as the alternative to netfilter port
// forwarding. One TCP and one UDP relay per forwarded port pair, derived
// from the same config snapshot the rule orchestrator consumes.

pub mod engine;
pub mod tcp;
pub mod udp;

pub use engine::{RelayBinding, RelayEngine, RelaySettings};
pub use tcp::TcpRelay;
pub use udp::UdpRelay;
