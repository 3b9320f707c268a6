//! Ordered, per-instance view of the remote image inventory.

use chrono::{DateTime, Utc};
use snapback_common::{
    CloudInventory, ImageFilter, Result, TagQuery, CONSISTENT_TAG, CONSISTENT_YES, SOURCE_TAG,
};
use tracing::debug;

/// Typed view of one backup image. The stamp string is preserved alongside
/// the parsed timestamp; ordering is defined over the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedImage {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub stamp: String,
    pub consistent: bool,
}

/// Lists `instance_id`'s images ascending by creation time.
///
/// The query is always scoped to the source instance; `extra` constraints
/// are merged in, never replacing that scope. Images without a parseable
/// creation stamp (e.g. created but never tagged) are excluded from the
/// view. The result is a snapshot at call time, not a live cursor.
pub async fn images_for_instance(
    inventory: &dyn CloudInventory,
    region: &str,
    instance_id: &str,
    extra: TagQuery,
) -> Result<Vec<OrderedImage>> {
    let filter = ImageFilter::by_tags(extra.scoped(SOURCE_TAG, instance_id));
    let mut view = Vec::new();
    for image in inventory.list_images(region, &filter).await? {
        match image.created_at() {
            Some(created_at) => view.push(OrderedImage {
                created_at,
                stamp: image.created_stamp().unwrap_or_default().to_string(),
                consistent: image.is_consistent(),
                id: image.id,
            }),
            None => {
                debug!(image_id = %image.id, "no usable creation stamp; excluded from inventory view");
            }
        }
    }
    view.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(view)
}

/// Id of the most recent crash-consistent image, if any.
pub async fn latest_consistent_image_id(
    inventory: &dyn CloudInventory,
    region: &str,
    instance_id: &str,
) -> Result<Option<String>> {
    let mut consistent = images_for_instance(
        inventory,
        region,
        instance_id,
        TagQuery::new().equals(CONSISTENT_TAG, CONSISTENT_YES),
    )
    .await?;
    Ok(consistent.pop().map(|image| image.id))
}
