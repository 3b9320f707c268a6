//! Retention: delete everything outside the keep window, except the most
//! recent crash-consistent image, which survives unconditionally.

use snapback_common::{CloudInventory, Instance, Result, TagQuery};
use tracing::{info, instrument, warn};

use crate::inventory::{images_for_instance, latest_consistent_image_id, OrderedImage};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Images in the ordered view before this pass.
    pub examined: usize,
    pub deleted: usize,
    /// Failed deletions; the same candidates come back next cycle.
    pub failed: usize,
    /// Images left behind after this pass, failures included.
    pub kept: usize,
}

/// Deletion candidates for an ascending inventory: everything outside the
/// last `keep_count` entries, minus the protected image. A keep count of
/// zero or less retains nothing beyond the protected image.
pub fn prune_candidates<'a>(
    images: &'a [OrderedImage],
    keep_count: i64,
    protected: Option<&str>,
) -> Vec<&'a OrderedImage> {
    let window = if keep_count <= 0 {
        0
    } else {
        (keep_count as usize).min(images.len())
    };
    images[..images.len() - window]
        .iter()
        .filter(|image| Some(image.id.as_str()) != protected)
        .collect()
}

/// Applies the instance's retention policy. Each deletion also releases the
/// image's backing storage; failures are counted and do not block the other
/// candidates.
#[instrument(skip(inventory, instance), fields(instance_id = %instance.id, region = %instance.region))]
pub async fn prune(inventory: &dyn CloudInventory, instance: &Instance) -> Result<PruneReport> {
    let keep_count = instance.keep_count();
    let protected = latest_consistent_image_id(inventory, &instance.region, &instance.id).await?;
    let images =
        images_for_instance(inventory, &instance.region, &instance.id, TagQuery::new()).await?;
    info!(count = images.len(), keep_count, "pruning old images");

    let mut report = PruneReport {
        examined: images.len(),
        ..Default::default()
    };
    for candidate in prune_candidates(&images, keep_count, protected.as_deref()) {
        match inventory
            .delete_image(&instance.region, &candidate.id, true)
            .await
        {
            Ok(()) => {
                info!(image_id = %candidate.id, "image deregistered");
                report.deleted += 1;
            }
            Err(e) => {
                warn!(image_id = %candidate.id, error = %e, "deletion failed; candidate stays for the next cycle");
                report.failed += 1;
            }
        }
    }
    report.kept = report.examined - report.deleted;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use snapback_common::parse_stamp;

    fn view(entries: &[(&str, &str, bool)]) -> Vec<OrderedImage> {
        let mut images: Vec<OrderedImage> = entries
            .iter()
            .map(|(id, stamp, consistent)| OrderedImage {
                id: id.to_string(),
                created_at: parse_stamp(stamp).unwrap(),
                stamp: stamp.to_string(),
                consistent: *consistent,
            })
            .collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        images
    }

    fn ids(candidates: &[&OrderedImage]) -> Vec<String> {
        candidates.iter().map(|image| image.id.clone()).collect()
    }

    #[test]
    fn keeps_the_newest_window() {
        let images = view(&[
            ("ami-1", "2024-01-01T00:00:00Z", false),
            ("ami-2", "2024-01-02T00:00:00Z", false),
            ("ami-3", "2024-01-03T00:00:00Z", false),
        ]);
        assert_eq!(ids(&prune_candidates(&images, 2, None)), vec!["ami-1"]);
        assert!(prune_candidates(&images, 3, None).is_empty());
        assert!(prune_candidates(&images, 10, None).is_empty());
    }

    #[test]
    fn protected_image_survives_outside_the_window() {
        let images = view(&[
            ("ami-1", "2024-01-01T00:00:00Z", false),
            ("ami-2", "2024-01-02T00:00:00Z", true),
            ("ami-3", "2024-01-03T00:00:00Z", false),
            ("ami-4", "2024-01-04T00:00:00Z", false),
            ("ami-5", "2024-01-05T00:00:00Z", false),
        ]);
        let candidates = prune_candidates(&images, 2, Some("ami-2"));
        assert_eq!(ids(&candidates), vec!["ami-1", "ami-3"]);
    }

    #[test]
    fn zero_or_negative_keep_prunes_everything_but_the_protected() {
        let images = view(&[
            ("ami-1", "2024-01-01T00:00:00Z", false),
            ("ami-2", "2024-01-02T00:00:00Z", true),
            ("ami-3", "2024-01-03T00:00:00Z", false),
        ]);
        assert_eq!(
            ids(&prune_candidates(&images, 0, Some("ami-2"))),
            vec!["ami-1", "ami-3"]
        );
        assert_eq!(
            ids(&prune_candidates(&images, -4, Some("ami-2"))),
            vec!["ami-1", "ami-3"]
        );
        assert_eq!(
            ids(&prune_candidates(&images, 0, None)),
            vec!["ami-1", "ami-2", "ami-3"]
        );
    }

    #[test]
    fn pruning_an_already_pruned_view_is_idempotent() {
        let images = view(&[
            ("ami-1", "2024-01-01T00:00:00Z", false),
            ("ami-2", "2024-01-02T00:00:00Z", false),
            ("ami-3", "2024-01-03T00:00:00Z", false),
        ]);
        let first_pass = prune_candidates(&images, 2, None);
        assert_eq!(ids(&first_pass), vec!["ami-1"]);

        let survivors: Vec<OrderedImage> = images
            .iter()
            .filter(|image| image.id != "ami-1")
            .cloned()
            .collect();
        assert!(prune_candidates(&survivors, 2, None).is_empty());
    }

    #[test]
    fn empty_inventory_yields_no_candidates() {
        let images: Vec<OrderedImage> = Vec::new();
        assert!(prune_candidates(&images, 7, None).is_empty());
        assert!(prune_candidates(&images, 0, None).is_empty());
    }

    #[test]
    fn consistency_history_scenario() {
        // keep 3 over [no, no, yes, no, no, no]: the three newest survive
        // plus the protected consistent image.
        let images = view(&[
            ("ami-1", "2024-01-01T00:00:00Z", false),
            ("ami-2", "2024-01-02T00:00:00Z", false),
            ("ami-3", "2024-01-03T00:00:00Z", true),
            ("ami-4", "2024-01-04T00:00:00Z", false),
            ("ami-5", "2024-01-05T00:00:00Z", false),
            ("ami-6", "2024-01-06T00:00:00Z", false),
        ]);
        let candidates = prune_candidates(&images, 3, Some("ami-3"));
        assert_eq!(ids(&candidates), vec!["ami-1", "ami-2"]);

        let survivors: Vec<&str> = images
            .iter()
            .map(|image| image.id.as_str())
            .filter(|id| !ids(&candidates).iter().any(|gone| gone == id))
            .collect();
        assert_eq!(survivors, vec!["ami-3", "ami-4", "ami-5", "ami-6"]);
    }

    #[test]
    fn ordering_definition_is_chronological_not_textual() {
        // Same instant rendered with different offsets still orders by time.
        let a = parse_stamp("2024-01-02T01:00:00+02:00").unwrap();
        let b = parse_stamp("2024-01-02T00:00:00Z").unwrap();
        assert_eq!(a, Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap());
        assert!(a < b);
    }
}
