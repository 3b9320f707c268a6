//! Snapshot orchestration: create the image, wait for it to become listable,
//! then tag it with its retention-relevant facts.

use chrono::{DateTime, Utc};
use snapback_common::{
    format_stamp, CloudInventory, ImageFilter, Instance, Result, CONSISTENT_TAG, CONSISTENT_YES,
    SOURCE_TAG, STAMP_TAG,
};
use tracing::{info, instrument, warn};

use crate::retry::{bounded_poll, RetryOutcome, RetryPolicy};

/// Whether the new image ended up carrying its tags. An untagged image is a
/// valid, recoverable state; the pruner simply ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    Tagged,
    VisibilityTimeout,
}

#[derive(Debug, Clone)]
pub struct CreatedBackup {
    pub image_id: String,
    /// Fixed-width creation stamp, also written as the stamp tag.
    pub stamp: String,
    pub consistent: bool,
    pub tag_outcome: TagOutcome,
}

/// Deterministic image name: display name with spaces collapsed, plus a
/// sortable UTC timestamp.
pub fn backup_name(instance: &Instance, now: DateTime<Utc>) -> String {
    format!(
        "{}_Backup_{}",
        instance.display_name().replace(' ', "_"),
        now.format("%Y%m%dT%H%M%SZ")
    )
}

pub fn backup_description(instance: &Instance, now: DateTime<Utc>) -> String {
    format!(
        "{} Backup on {} (UTC)",
        instance.display_name(),
        now.format("%a %b %e %H:%M:%S %Y")
    )
}

/// Creates a backup image of `instance` and tags it once visible.
///
/// A rejected create propagates. The visibility wait is bounded by `retry`;
/// exhaustion degrades to `TagOutcome::VisibilityTimeout` instead of failing
/// the cycle.
#[instrument(skip(inventory, instance, retry), fields(instance_id = %instance.id, region = %instance.region))]
pub async fn create_backup(
    inventory: &dyn CloudInventory,
    instance: &Instance,
    skip_reboot: bool,
    now: DateTime<Utc>,
    retry: RetryPolicy,
) -> Result<CreatedBackup> {
    let name = backup_name(instance, now);
    let description = backup_description(instance, now);
    let stamp = format_stamp(now);

    let image_id = inventory
        .create_image(instance, &name, &description, skip_reboot)
        .await?;
    info!(%image_id, %name, no_reboot = skip_reboot, "created image");

    // The listing API may lag the create call.
    let region = instance.region.as_str();
    let filter = ImageFilter::by_id(&image_id);
    let visible = bounded_poll(retry, || {
        let filter = filter.clone();
        async move {
            let mut images = inventory.list_images(region, &filter).await?;
            Ok(images.pop())
        }
    })
    .await;

    let tag_outcome = match visible {
        RetryOutcome::Ready { attempts, .. } => {
            if attempts > 1 {
                info!(%image_id, attempts, "image became visible after retrying");
            }
            inventory
                .tag_resource(region, &image_id, STAMP_TAG, &stamp)
                .await?;
            inventory
                .tag_resource(region, &image_id, SOURCE_TAG, &instance.id)
                .await?;
            if !skip_reboot {
                inventory
                    .tag_resource(region, &image_id, CONSISTENT_TAG, CONSISTENT_YES)
                    .await?;
            }
            TagOutcome::Tagged
        }
        RetryOutcome::Exhausted { attempts } => {
            warn!(%image_id, attempts, "image never became listable; leaving it untagged");
            TagOutcome::VisibilityTimeout
        }
    };

    Ok(CreatedBackup {
        image_id,
        stamp,
        consistent: !skip_reboot,
        tag_outcome,
    })
}
