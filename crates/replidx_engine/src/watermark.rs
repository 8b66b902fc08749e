//! Per-instance watermark tracking.
//!
//! A watermark records the selection criteria and end timestamp of the last
//! committed pass for one source instance, so the next pass can request
//! only the changes since then. No watermark means no pass has committed
//! for that instance and a full scan is required.

use crate::error::{SyncError, SyncResult};
use crate::types::{InstanceId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The resumable cursor of one source instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Selection criteria used by the last committed pass.
    pub selection_formula: String,
    /// Timestamp the next pass should start from.
    pub last_end_timestamp: Timestamp,
}

/// All watermarks of a target plus the instance synced most recently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkTable {
    instances: BTreeMap<InstanceId, Watermark>,
    last_instance_synced: Option<InstanceId>,
}

impl WatermarkTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the watermark of an instance.
    pub fn get(&self, instance: &InstanceId) -> Option<&Watermark> {
        self.instances.get(instance)
    }

    /// Records a watermark and marks the instance as synced last.
    pub fn set(&mut self, instance: &InstanceId, watermark: Watermark) {
        self.instances.insert(instance.clone(), watermark);
        self.last_instance_synced = Some(instance.clone());
    }

    /// Drops the watermark of an instance. Returns true if one existed.
    pub fn forget(&mut self, instance: &InstanceId) -> bool {
        if self.last_instance_synced.as_ref() == Some(instance) {
            self.last_instance_synced = None;
        }
        self.instances.remove(instance).is_some()
    }

    /// Returns the instance of the most recent committed pass.
    pub fn last_instance_synced(&self) -> Option<&InstanceId> {
        self.last_instance_synced.as_ref()
    }

    /// Iterates watermarks ordered by instance id.
    pub fn iter(&self) -> impl Iterator<Item = (&InstanceId, &Watermark)> {
        self.instances.iter()
    }

    /// Number of instances with a watermark.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if no instance has a watermark.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Persists watermarks between passes.
///
/// [`set`](Self::set) is only ever called from a successful commit.
pub trait WatermarkStore: Send + Sync {
    /// Returns the watermark of an instance, if a pass has committed for it.
    fn get(&self, instance: &InstanceId) -> SyncResult<Option<Watermark>>;

    /// Records the watermark of an instance.
    fn set(
        &self,
        instance: &InstanceId,
        selection_formula: &str,
        last_end_timestamp: Timestamp,
    ) -> SyncResult<()>;

    /// Returns the instance of the most recent committed pass.
    fn last_instance_synced(&self) -> SyncResult<Option<InstanceId>>;

    /// Drops the watermark of an instance so its next pass is a full scan.
    fn forget(&self, instance: &InstanceId) -> SyncResult<bool>;
}

impl<W: WatermarkStore + ?Sized> WatermarkStore for Arc<W> {
    fn get(&self, instance: &InstanceId) -> SyncResult<Option<Watermark>> {
        (**self).get(instance)
    }

    fn set(
        &self,
        instance: &InstanceId,
        selection_formula: &str,
        last_end_timestamp: Timestamp,
    ) -> SyncResult<()> {
        (**self).set(instance, selection_formula, last_end_timestamp)
    }

    fn last_instance_synced(&self) -> SyncResult<Option<InstanceId>> {
        (**self).last_instance_synced()
    }

    fn forget(&self, instance: &InstanceId) -> SyncResult<bool> {
        (**self).forget(instance)
    }
}

/// An in-memory watermark store.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    table: RwLock<WatermarkTable>,
}

impl MemoryWatermarkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current table.
    pub fn snapshot(&self) -> WatermarkTable {
        self.table.read().clone()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn get(&self, instance: &InstanceId) -> SyncResult<Option<Watermark>> {
        Ok(self.table.read().get(instance).cloned())
    }

    fn set(
        &self,
        instance: &InstanceId,
        selection_formula: &str,
        last_end_timestamp: Timestamp,
    ) -> SyncResult<()> {
        self.table.write().set(
            instance,
            Watermark {
                selection_formula: selection_formula.to_string(),
                last_end_timestamp,
            },
        );
        Ok(())
    }

    fn last_instance_synced(&self) -> SyncResult<Option<InstanceId>> {
        Ok(self.table.read().last_instance_synced().cloned())
    }

    fn forget(&self, instance: &InstanceId) -> SyncResult<bool> {
        Ok(self.table.write().forget(instance))
    }
}

/// A watermark store persisted as a JSON file.
///
/// # Durability
///
/// Every change rewrites the whole table to a sibling temporary file,
/// syncs it, and renames it over the original. A failed write leaves both
/// the file and the in-memory table unchanged.
#[derive(Debug)]
pub struct FileWatermarkStore {
    path: PathBuf,
    table: RwLock<WatermarkTable>,
}

impl FileWatermarkStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: &Path) -> SyncResult<Self> {
        let table = if path.exists() {
            let bytes = fs::read(path)?;
            serde_json::from_slice(&bytes)?
        } else {
            WatermarkTable::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            table: RwLock::new(table),
        })
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of the current table.
    pub fn snapshot(&self) -> WatermarkTable {
        self.table.read().clone()
    }

    fn persist(&self, table: &WatermarkTable) -> SyncResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = File::create(&tmp_path)?;
        file.write_all(&serde_json::to_vec_pretty(table)?)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut WatermarkTable) -> T) -> SyncResult<T> {
        let mut table = self.table.write();
        let mut next = table.clone();
        let result = f(&mut next);
        self.persist(&next).map_err(|e| {
            SyncError::Watermark(format!("writing {}: {e}", self.path.display()))
        })?;
        *table = next;
        Ok(result)
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn get(&self, instance: &InstanceId) -> SyncResult<Option<Watermark>> {
        Ok(self.table.read().get(instance).cloned())
    }

    fn set(
        &self,
        instance: &InstanceId,
        selection_formula: &str,
        last_end_timestamp: Timestamp,
    ) -> SyncResult<()> {
        let watermark = Watermark {
            selection_formula: selection_formula.to_string(),
            last_end_timestamp,
        };
        self.modify(|table| table.set(instance, watermark))
    }

    fn last_instance_synced(&self) -> SyncResult<Option<InstanceId>> {
        Ok(self.table.read().last_instance_synced().cloned())
    }

    fn forget(&self, instance: &InstanceId) -> SyncResult<bool> {
        self.modify(|table| table.forget(instance))
    }
}
