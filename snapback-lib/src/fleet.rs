//! Fleet snapshot loading for rehearsal runs.

use std::path::Path;

use snapback_common::{BackupError, Result};
use snapback_engine::memory::FleetSnapshot;

/// Reads a JSON fleet snapshot. Any problem here is a configuration error,
/// surfaced before the cycle starts.
pub fn load_snapshot(path: &Path) -> Result<FleetSnapshot> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BackupError::Config(format!("cannot read fleet snapshot {}: {e}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        BackupError::Config(format!("invalid fleet snapshot {}: {e}", path.display()))
    })
}
