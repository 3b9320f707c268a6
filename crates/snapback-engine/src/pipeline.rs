//! Per-instance cycle: decide → stamp → capture → tag → prune.

use chrono::{DateTime, Utc};
use snapback_common::{CloudInventory, Instance, Result};
use tracing::{info, instrument};

use crate::orchestrator::{create_backup, TagOutcome};
use crate::reboot::{decide, record_reboot};
use crate::retention::{prune, PruneReport};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
pub struct CycleConfig {
    /// The instance the engine itself runs on, if known; it is never
    /// rebooted.
    pub own_instance_id: Option<String>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub instance_id: String,
    pub region: String,
    pub image_id: String,
    pub rebooted: bool,
    pub consistent: bool,
    pub tag_outcome: TagOutcome,
    pub prune: PruneReport,
}

/// Runs one full backup cycle for a single instance. Failures propagate to
/// the caller, which isolates them from other instances' pipelines.
#[instrument(skip(inventory, config, instance), fields(instance_id = %instance.id, region = %instance.region))]
pub async fn run_instance_cycle(
    inventory: &dyn CloudInventory,
    config: &CycleConfig,
    instance: &Instance,
    now: DateTime<Utc>,
) -> Result<InstanceOutcome> {
    let decision = decide(instance, config.own_instance_id.as_deref(), now);
    if !decision.skip_reboot {
        // Stamped ahead of the capture so a crash mid-cycle cannot
        // double-reboot on retry.
        record_reboot(inventory, instance, now).await?;
    }

    let backup = create_backup(inventory, instance, decision.skip_reboot, now, config.retry).await?;
    let prune_report = prune(inventory, instance).await?;

    info!(
        image_id = %backup.image_id,
        consistent = backup.consistent,
        deleted = prune_report.deleted,
        "instance cycle complete"
    );
    Ok(InstanceOutcome {
        instance_id: instance.id.clone(),
        region: instance.region.clone(),
        image_id: backup.image_id,
        rebooted: !decision.skip_reboot,
        consistent: backup.consistent,
        tag_outcome: backup.tag_outcome,
        prune: prune_report,
    })
}
