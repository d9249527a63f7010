// vmnet-rules: structured command builders, the command-execution capability,
// and the rule lifecycle orchestrator (activate/deactivate).

pub mod cmd;
pub mod orchestrator;
pub mod plan;
pub mod runner;

pub use cmd::{Cmd, RuleStep};
pub use orchestrator::{ApplyMode, ApplyReport, Orchestrator};
pub use runner::{CommandRunner, HostRunner, RecordingRunner};
