//! Backup lifecycle policy engine.
//!
//! Turns instance metadata (tags, launch time, reboot history) into an
//! idempotent sequence of create/tag/prune decisions against an
//! eventually-consistent remote inventory. The remote side is reached only
//! through the [`snapback_common::CloudInventory`] trait.

pub mod inventory;
pub mod memory;
pub mod orchestrator;
pub mod pipeline;
pub mod reboot;
pub mod retention;
pub mod retry;

// Re-export dependencies used in public interfaces
pub use snapback_common as common;

pub use orchestrator::{CreatedBackup, TagOutcome};
pub use pipeline::{run_instance_cycle, CycleConfig, InstanceOutcome};
pub use reboot::RebootDecision;
pub use retention::PruneReport;
pub use retry::{RetryOutcome, RetryPolicy};
