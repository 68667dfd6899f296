//! Snapshot persistence for the fleet.
//!
//! The fleet is stored as a single versioned JSON document at
//! `<config dir>/instances.json`. Writes go through a temp file and rename
//! so a crash mid-save never corrupts the previous snapshot. Loads are
//! tolerant: a missing file is an empty fleet, a corrupt one is an empty
//! fleet with a warning (the operator's panes and branches still exist; the
//! supervisor just forgets about them rather than refusing to start).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use corral_session::InstanceSnapshot;
use corral_types::CorralError;

pub const SNAPSHOT_FILE_NAME: &str = "instances.json";

/// Current snapshot schema version. Readers accept this and one prior.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    schema_version: u32,
    instances: Vec<InstanceSnapshot>,
}

/// Reads and writes the supervisor snapshot. Holds no live state.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(SNAPSHOT_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all instance records. Never fails; degraded loads warn and
    /// return an empty fleet.
    pub fn load(&self) -> Vec<InstanceSnapshot> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read snapshot, starting with empty fleet");
                return Vec::new();
            }
        };

        let doc: SnapshotDoc = match serde_json::from_str(&data) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to parse snapshot, starting with empty fleet");
                return Vec::new();
            }
        };

        if doc.schema_version > SCHEMA_VERSION || doc.schema_version + 1 < SCHEMA_VERSION {
            warn!(
                found = doc.schema_version,
                supported = SCHEMA_VERSION,
                "unsupported snapshot schema version, starting with empty fleet"
            );
            return Vec::new();
        }

        info!(count = doc.instances.len(), "loaded instance snapshot");
        doc.instances
    }

    /// Atomically rewrite the snapshot document.
    pub fn save(&self, instances: &[InstanceSnapshot]) -> Result<(), CorralError> {
        let doc = SnapshotDoc {
            schema_version: SCHEMA_VERSION,
            instances: instances.to_vec(),
        };
        let data = serde_json::to_string_pretty(&doc)
            .map_err(|e| CorralError::Store(format!("failed to serialize snapshot: {e}")))?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| CorralError::Store("snapshot path has no parent".into()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| CorralError::Store(format!("failed to create config directory: {e}")))?;

        // Write-then-rename keeps the old snapshot intact on a crash.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .map_err(|e| CorralError::Store(format!("failed to write snapshot: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| CorralError::Store(format!("failed to replace snapshot: {e}")))?;
        Ok(())
    }

    /// Delete the snapshot file (`reset` subcommand).
    pub fn delete(&self) -> Result<(), CorralError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CorralError::Store(format!(
                "failed to delete snapshot: {err}"
            ))),
        }
    }
}
