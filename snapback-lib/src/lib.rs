//! Fleet-level composition of the snapback policy engine: run context,
//! region/instance discovery, and the cycle report.

pub mod context;
pub mod fleet;
pub mod runner;

pub use context::{BackupContext, RunOptions};
pub use runner::{run_fleet_cycle, FleetReport};
