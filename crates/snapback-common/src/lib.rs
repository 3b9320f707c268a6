// Shared data model and the collaborator seam used by every snapback crate.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag whose presence selects an instance for backup; a numeric value
/// overrides the retained image count.
pub const FILTER_TAG: &str = "Backup";
/// Tag suppressing reboots for an instance's backups.
pub const NO_REBOOT_TAG: &str = "NoReboot";
/// Tag carrying an RFC 2445 RRULE governing forced reboot days.
pub const REBOOT_RRULE_TAG: &str = "RebootRRule";
/// Tag marking an image as crash-consistent (captured with reboot/quiesce).
pub const CONSISTENT_TAG: &str = "Consistent";
/// Creation stamp written on every image, fixed-width ISO-8601 UTC.
pub const STAMP_TAG: &str = "AutoBackupTimestamp";
/// Stamp of the last engine-triggered reboot, written on the instance.
pub const REBOOT_STAMP_TAG: &str = "LastRebootTime";
/// Back-reference from an image to its source instance.
pub const SOURCE_TAG: &str = "SourceInstanceId";
/// Display name tag, used when naming images.
pub const NAME_TAG: &str = "Name";

pub const CONSISTENT_YES: &str = "Yes";
pub const DEFAULT_KEEP: i64 = 7;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backend Error: {0}")]
    Backend(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Malformed Tag: {0}")]
    MalformedTag(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

// Define the primary Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Fixed-width stamp format: zero-padded, UTC-normalized, so lexicographic
/// order on the tag value equals chronological order.
pub const STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_stamp(at: DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Parses a stamp tag back into a timestamp. Accepts any RFC 3339 offset
/// form so stamps written by other tooling still order correctly.
pub fn parse_stamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| BackupError::MalformedTag(format!("{value}: {e}")))
}

/// A remote compute resource, read-only for the duration of one cycle.
/// Policy-relevant facts are tag-encoded; the typed accessors below are the
/// only way the engine reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub region: String,
    pub launch_time: DateTime<Utc>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Instance {
    /// Name tag, falling back to the instance id.
    pub fn display_name(&self) -> &str {
        self.tags.get(NAME_TAG).map(String::as_str).unwrap_or(&self.id)
    }

    /// Retained image count from the `Backup` tag. Non-numeric values fall
    /// back to the default; zero and negative values are honored as policy.
    pub fn keep_count(&self) -> i64 {
        self.tags
            .get(FILTER_TAG)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_KEEP)
    }

    pub fn wants_no_reboot(&self) -> bool {
        self.tags.contains_key(NO_REBOOT_TAG)
    }

    pub fn reboot_rule(&self) -> Option<&str> {
        self.tags.get(REBOOT_RRULE_TAG).map(String::as_str)
    }

    /// Last engine-triggered reboot, if recorded and parseable.
    pub fn last_reboot_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.tags.get(REBOOT_STAMP_TAG)?;
        parse_stamp(raw).ok()
    }

    /// Anchor for recurrence evaluation: last reboot, else launch time.
    pub fn reboot_anchor(&self) -> DateTime<Utc> {
        self.last_reboot_time().unwrap_or(self.launch_time)
    }
}

/// A backup image. Facts the engine relies on are tag-encoded and parsed on
/// access; an image missing its stamp is a valid intermediate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub region: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Image {
    pub fn source_instance(&self) -> Option<&str> {
        self.tags.get(SOURCE_TAG).map(String::as_str)
    }

    pub fn created_stamp(&self) -> Option<&str> {
        self.tags.get(STAMP_TAG).map(String::as_str)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_stamp().and_then(|raw| parse_stamp(raw).ok())
    }

    pub fn is_consistent(&self) -> bool {
        self.tags.get(CONSISTENT_TAG).map(String::as_str) == Some(CONSISTENT_YES)
    }
}

/// Conjunction of tag matchers: key presence, or key equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagQuery {
    matchers: Vec<TagMatcher>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatcher {
    pub key: String,
    /// None matches any value (presence check).
    pub value: Option<String>,
}

impl TagQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn present(mut self, key: impl Into<String>) -> Self {
        self.matchers.push(TagMatcher { key: key.into(), value: None });
        self
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.matchers.push(TagMatcher {
            key: key.into(),
            value: Some(value.into()),
        });
        self
    }

    /// Adds an equality matcher only when no matcher for `key` exists yet.
    /// Callers merging a mandatory scope into caller-supplied filters use
    /// this so the scope never replaces an explicit constraint.
    pub fn scoped(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if !self.has_key(&key) {
            self.matchers.push(TagMatcher { key, value: Some(value.into()) });
        }
        self
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.matchers.iter().any(|m| m.key == key)
    }

    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        self.matchers.iter().all(|m| match &m.value {
            Some(want) => tags.get(&m.key) == Some(want),
            None => tags.contains_key(&m.key),
        })
    }
}

/// Image listing constraint: optional id lookup plus tag matchers.
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub image_id: Option<String>,
    pub tags: TagQuery,
}

impl ImageFilter {
    pub fn by_id(image_id: impl Into<String>) -> Self {
        Self {
            image_id: Some(image_id.into()),
            tags: TagQuery::new(),
        }
    }

    pub fn by_tags(tags: TagQuery) -> Self {
        Self { image_id: None, tags }
    }

    pub fn matches(&self, image: &Image) -> bool {
        if let Some(id) = &self.image_id {
            if *id != image.id {
                return false;
            }
        }
        self.tags.matches(&image.tags)
    }
}

/// The narrow seam to the remote inventory. Listing is eventually consistent
/// with respect to recent `create_image` calls; everything else behaves as a
/// plain remote CRUD surface.
#[async_trait]
pub trait CloudInventory: Send + Sync {
    async fn list_regions(&self) -> Result<Vec<String>>;

    async fn list_instances(&self, region: &str, filter: &TagQuery) -> Result<Vec<Instance>>;

    /// Returns the new image id. `no_reboot == false` means the source is
    /// rebooted/quiesced for the capture.
    async fn create_image(
        &self,
        instance: &Instance,
        name: &str,
        description: &str,
        no_reboot: bool,
    ) -> Result<String>;

    async fn list_images(&self, region: &str, filter: &ImageFilter) -> Result<Vec<Image>>;

    async fn tag_resource(
        &self,
        region: &str,
        resource_id: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Deletes an image record, optionally releasing its backing storage.
    async fn delete_image(
        &self,
        region: &str,
        image_id: &str,
        delete_backing_storage: bool,
    ) -> Result<()>;

    /// Identifies the host the engine runs on, for self-protection.
    async fn own_instance_id(&self) -> Result<Option<String>>;
}
