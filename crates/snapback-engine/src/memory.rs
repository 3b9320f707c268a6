//! Deterministic in-memory inventory backend.
//!
//! Models the one backend behavior the engine has to be hardened against:
//! listing lags creation. A freshly created image stays invisible for a
//! configurable number of list calls in its region. Fault injection hooks
//! cover the error-isolation paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snapback_common::{
    BackupError, CloudInventory, Image, ImageFilter, Instance, Result, TagQuery,
};

#[derive(Default)]
pub struct InMemoryInventory {
    own_instance_id: Option<String>,
    visibility_lag: u32,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    regions: BTreeMap<String, RegionState>,
    next_image: u64,
    /// Source instances of captures taken with an actual reboot.
    rebooted: Vec<String>,
    /// Image deletions in order, with the backing-storage flag.
    deletions: Vec<(String, bool)>,
    fail_create: HashSet<String>,
    fail_delete: HashSet<String>,
}

#[derive(Default)]
struct RegionState {
    instances: Vec<Instance>,
    images: Vec<StoredImage>,
}

struct StoredImage {
    image: Image,
    /// List calls in this region before the image becomes visible.
    lag_remaining: u32,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_own_instance_id(mut self, id: impl Into<String>) -> Self {
        self.own_instance_id = Some(id.into());
        self
    }

    pub fn with_visibility_lag(mut self, lag: u32) -> Self {
        self.visibility_lag = lag;
        self
    }

    pub fn from_snapshot(snapshot: FleetSnapshot) -> Self {
        let mut regions = BTreeMap::new();
        for (name, region) in snapshot.regions {
            regions.insert(
                name,
                RegionState {
                    instances: region.instances,
                    images: region
                        .images
                        .into_iter()
                        .map(|image| StoredImage {
                            image,
                            lag_remaining: 0,
                        })
                        .collect(),
                },
            );
        }
        Self {
            own_instance_id: snapshot.own_instance_id,
            visibility_lag: snapshot.visibility_lag,
            state: Mutex::new(State {
                regions,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BackupError::Backend("inventory state lock poisoned".to_string()))
    }

    pub fn add_instance(&self, instance: Instance) -> Result<()> {
        let mut state = self.lock()?;
        state
            .regions
            .entry(instance.region.clone())
            .or_default()
            .instances
            .push(instance);
        Ok(())
    }

    /// Seeds a pre-existing image; it is immediately visible.
    pub fn seed_image(&self, image: Image) -> Result<()> {
        let mut state = self.lock()?;
        state
            .regions
            .entry(image.region.clone())
            .or_default()
            .images
            .push(StoredImage {
                image,
                lag_remaining: 0,
            });
        Ok(())
    }

    pub fn fail_create_for(&self, instance_id: impl Into<String>) -> Result<()> {
        self.lock()?.fail_create.insert(instance_id.into());
        Ok(())
    }

    pub fn fail_delete_for(&self, image_id: impl Into<String>) -> Result<()> {
        self.lock()?.fail_delete.insert(image_id.into());
        Ok(())
    }

    /// Instances that were rebooted for a capture, in capture order.
    pub fn rebooted(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.rebooted.clone())
    }

    pub fn deletions(&self) -> Result<Vec<(String, bool)>> {
        Ok(self.lock()?.deletions.clone())
    }

    pub fn deleted_ids(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.deletions.iter().map(|(id, _)| id.clone()).collect())
    }

    pub fn image_tags(&self, region: &str, image_id: &str) -> Result<HashMap<String, String>> {
        let state = self.lock()?;
        state
            .regions
            .get(region)
            .and_then(|r| r.images.iter().find(|stored| stored.image.id == image_id))
            .map(|stored| stored.image.tags.clone())
            .ok_or_else(|| BackupError::NotFound(format!("image {image_id}")))
    }

    pub fn instance_tags(&self, region: &str, instance_id: &str) -> Result<HashMap<String, String>> {
        let state = self.lock()?;
        state
            .regions
            .get(region)
            .and_then(|r| r.instances.iter().find(|i| i.id == instance_id))
            .map(|instance| instance.tags.clone())
            .ok_or_else(|| BackupError::NotFound(format!("instance {instance_id}")))
    }

    /// Ids of every image currently stored in `region`, visible or not.
    pub fn stored_image_ids(&self, region: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .regions
            .get(region)
            .map(|r| r.images.iter().map(|stored| stored.image.id.clone()).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CloudInventory for InMemoryInventory {
    async fn list_regions(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.regions.keys().cloned().collect())
    }

    async fn list_instances(&self, region: &str, filter: &TagQuery) -> Result<Vec<Instance>> {
        let state = self.lock()?;
        Ok(state
            .regions
            .get(region)
            .map(|r| {
                r.instances
                    .iter()
                    .filter(|instance| filter.matches(&instance.tags))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_image(
        &self,
        instance: &Instance,
        _name: &str,
        _description: &str,
        no_reboot: bool,
    ) -> Result<String> {
        let mut state = self.lock()?;
        if state.fail_create.contains(&instance.id) {
            return Err(BackupError::Backend(format!(
                "create_image rejected for {}",
                instance.id
            )));
        }
        let id = format!("ami-{:08x}", state.next_image);
        state.next_image += 1;
        if !no_reboot {
            state.rebooted.push(instance.id.clone());
        }
        let lag_remaining = self.visibility_lag;
        state
            .regions
            .entry(instance.region.clone())
            .or_default()
            .images
            .push(StoredImage {
                image: Image {
                    id: id.clone(),
                    region: instance.region.clone(),
                    tags: HashMap::new(),
                },
                lag_remaining,
            });
        Ok(id)
    }

    async fn list_images(&self, region: &str, filter: &ImageFilter) -> Result<Vec<Image>> {
        let mut state = self.lock()?;
        let Some(region_state) = state.regions.get_mut(region) else {
            return Ok(Vec::new());
        };
        let mut visible = Vec::new();
        for stored in &mut region_state.images {
            if stored.lag_remaining > 0 {
                stored.lag_remaining -= 1;
                continue;
            }
            if filter.matches(&stored.image) {
                visible.push(stored.image.clone());
            }
        }
        Ok(visible)
    }

    async fn tag_resource(
        &self,
        region: &str,
        resource_id: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let region_state = state
            .regions
            .get_mut(region)
            .ok_or_else(|| BackupError::NotFound(format!("region {region}")))?;
        if let Some(stored) = region_state
            .images
            .iter_mut()
            .find(|stored| stored.image.id == resource_id)
        {
            stored.image.tags.insert(key.to_string(), value.to_string());
            return Ok(());
        }
        if let Some(instance) = region_state
            .instances
            .iter_mut()
            .find(|instance| instance.id == resource_id)
        {
            instance.tags.insert(key.to_string(), value.to_string());
            return Ok(());
        }
        Err(BackupError::NotFound(format!("resource {resource_id}")))
    }

    async fn delete_image(
        &self,
        region: &str,
        image_id: &str,
        delete_backing_storage: bool,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_delete.contains(image_id) {
            return Err(BackupError::Backend(format!(
                "delete_image rejected for {image_id}"
            )));
        }
        let region_state = state
            .regions
            .get_mut(region)
            .ok_or_else(|| BackupError::NotFound(format!("region {region}")))?;
        let index = region_state
            .images
            .iter()
            .position(|stored| stored.image.id == image_id)
            .ok_or_else(|| BackupError::NotFound(format!("image {image_id}")))?;
        region_state.images.remove(index);
        state
            .deletions
            .push((image_id.to_string(), delete_backing_storage));
        Ok(())
    }

    async fn own_instance_id(&self) -> Result<Option<String>> {
        Ok(self.own_instance_id.clone())
    }
}

/// Declarative fleet state, loadable from JSON, for rehearsal runs and
/// tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    #[serde(default)]
    pub own_instance_id: Option<String>,
    #[serde(default)]
    pub visibility_lag: u32,
    #[serde(default)]
    pub regions: BTreeMap<String, RegionSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionSnapshot {
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub images: Vec<Image>,
}
