//! Fleet cycle: discover instances region by region and run each one's
//! backup pipeline, isolating per-instance failures from the rest.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use snapback_common::{BackupError, Result, TagQuery, FILTER_TAG};
use snapback_engine::orchestrator::TagOutcome;
use snapback_engine::pipeline::{run_instance_cycle, CycleConfig, InstanceOutcome};
use tracing::{error, info, instrument, warn};

use crate::context::BackupContext;

#[derive(Debug, Default, Clone)]
pub struct FleetReport {
    pub regions: usize,
    pub instances: usize,
    pub images_created: usize,
    pub consistent_backups: usize,
    pub visibility_timeouts: usize,
    pub images_deleted: usize,
    pub delete_failures: usize,
    /// Isolated failures: (instance id or `region:<name>`, error text).
    pub failures: Vec<(String, String)>,
}

impl FleetReport {
    fn absorb(&mut self, outcome: &InstanceOutcome) {
        self.instances += 1;
        self.images_created += 1;
        if outcome.consistent {
            self.consistent_backups += 1;
        }
        if outcome.tag_outcome == TagOutcome::VisibilityTimeout {
            self.visibility_timeouts += 1;
        }
        self.images_deleted += outcome.prune.deleted;
        self.delete_failures += outcome.prune.failed;
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.delete_failures == 0 && self.visibility_timeouts == 0
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} instances across {} regions: {} images created ({} consistent), {} pruned",
            self.instances, self.regions, self.images_created, self.consistent_backups, self.images_deleted
        )?;
        if self.visibility_timeouts > 0 {
            write!(f, ", {} left untagged", self.visibility_timeouts)?;
        }
        if self.delete_failures > 0 {
            write!(f, ", {} deletions failed", self.delete_failures)?;
        }
        for (subject, reason) in &self.failures {
            write!(f, "\n  failed {subject}: {reason}")?;
        }
        Ok(())
    }
}

/// Runs one backup cycle over the whole fleet.
///
/// Configuration-level problems (an unresolvable region selection, a failed
/// region listing) are fatal before any instance is touched; everything
/// after that is isolated and reported.
#[instrument(skip(ctx, now))]
pub async fn run_fleet_cycle(ctx: &BackupContext, now: DateTime<Utc>) -> Result<FleetReport> {
    let backend = ctx.backend.as_ref();

    let own_instance_id = match backend.own_instance_id().await {
        Ok(id) => {
            info!(own_instance_id = ?id, "resolved own instance id");
            id
        }
        Err(e) => {
            warn!(error = %e, "could not resolve own instance id; self-protection disabled");
            None
        }
    };

    let available = backend.list_regions().await?;
    let regions: Vec<String> = if ctx.options.regions.is_empty() {
        available
    } else {
        for requested in &ctx.options.regions {
            if !available.contains(requested) {
                warn!(region = %requested, "requested region not reported by backend");
            }
        }
        available
            .into_iter()
            .filter(|region| ctx.options.regions.contains(region))
            .collect()
    };
    if regions.is_empty() {
        return Err(BackupError::Config(
            "no requested region could be resolved".to_string(),
        ));
    }

    let config = CycleConfig {
        own_instance_id,
        retry: ctx.options.retry,
    };
    let selector = TagQuery::new().present(FILTER_TAG);
    let mut report = FleetReport {
        regions: regions.len(),
        ..Default::default()
    };

    for region in &regions {
        let instances = match backend.list_instances(region, &selector).await {
            Ok(instances) => instances,
            Err(e) => {
                error!(%region, error = %e, "could not list instances; skipping region");
                report.failures.push((format!("region:{region}"), e.to_string()));
                continue;
            }
        };
        info!(%region, count = instances.len(), "processing instances");

        let outcomes: Vec<(String, Result<InstanceOutcome>)> = stream::iter(instances)
            .map(|instance| {
                let backend = Arc::clone(&ctx.backend);
                let config = config.clone();
                async move {
                    let instance_id = instance.id.clone();
                    let outcome =
                        run_instance_cycle(backend.as_ref(), &config, &instance, now).await;
                    (instance_id, outcome)
                }
            })
            .buffer_unordered(ctx.options.parallelism.max(1))
            .collect()
            .await;

        for (instance_id, outcome) in outcomes {
            match outcome {
                Ok(outcome) => report.absorb(&outcome),
                Err(e) => {
                    error!(%instance_id, error = %e, "instance cycle failed");
                    report.failures.push((instance_id, e.to_string()));
                }
            }
        }
    }

    info!(
        instances = report.instances,
        created = report.images_created,
        deleted = report.images_deleted,
        failures = report.failures.len(),
        "fleet cycle complete"
    );
    Ok(report)
}
