//! Changed-block lists between precopy rounds
//!
//! Extent lists can be large, so each VM's lists are spilled to a file under
//! the working directory instead of living in status. Entries are tagged
//! with the precopy round they belong to. The store is process-local: after
//! a restart the lists are simply absent and the round is recomputed.

use std::collections::HashMap;
use std::path::PathBuf;

use forklift_adapter::DiskChanges;
use forklift_common::filebacked::SpillFile;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::PlanError;

/// Spilled changed-block lists keyed by `migration/vm`
pub struct DeltaStore {
    dir: PathBuf,
    files: Mutex<HashMap<String, SpillFile>>,
}

/// Key of one VM within one migration
pub fn delta_key(migration: &str, vm: &str) -> String {
    format!("{migration}/{vm}")
}

impl DeltaStore {
    /// Store spilling under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Record one disk's changes for a round
    pub fn record(&self, key: &str, round: u16, changes: &DiskChanges) -> Result<(), PlanError> {
        let mut files = self.files.lock();
        let file = match files.entry(key.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(SpillFile::create_in(&self.dir)?)
            }
        };
        let index = file.append(round, changes)?;
        debug!(vm = %key, round, disk = %changes.disk, index, "spilled changed blocks");
        Ok(())
    }

    /// Every disk's changes recorded for a round
    pub fn round(&self, key: &str, round: u16) -> Result<Vec<DiskChanges>, PlanError> {
        let mut files = self.files.lock();
        let Some(file) = files.get_mut(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for entry in file.iter::<DiskChanges>() {
            let (kind, changes) = entry?;
            if kind == round {
                out.push(changes);
            }
        }
        Ok(out)
    }

    /// Changed bytes recorded for a round
    pub fn delta_bytes(&self, key: &str, round: u16) -> Result<u64, PlanError> {
        Ok(self.round(key, round)?.iter().map(DiskChanges::delta_bytes).sum())
    }

    /// Drop a VM's lists and remove its file
    pub fn forget(&self, key: &str) {
        if self.files.lock().remove(key).is_some() {
            debug!(vm = %key, "removed changed-block spill file");
        }
    }
}
