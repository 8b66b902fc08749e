//! Per-pass staging of index mutations.

use crate::types::{SyncRecord, UniqueId};
use std::collections::BTreeMap;

/// Accumulates the adds and removes of one pass without touching the index.
///
/// At most one pending add and one pending remove are kept per unique id.
/// A pending remove always refers to the record currently committed in the
/// index; a pending add is the newest version seen during the pass.
#[derive(Debug, Clone)]
pub struct StagingBuffer<R> {
    adds: BTreeMap<UniqueId, R>,
    removes: BTreeMap<UniqueId, R>,
    wipe: bool,
}

impl<R: SyncRecord> StagingBuffer<R> {
    /// Creates an empty staging buffer.
    pub fn new() -> Self {
        Self {
            adds: BTreeMap::new(),
            removes: BTreeMap::new(),
            wipe: false,
        }
    }

    /// Returns the pending add for an id, if any.
    pub fn pending_add(&self, id: &UniqueId) -> Option<&R> {
        self.adds.get(id)
    }

    /// Returns true if the committed record for an id is staged for removal.
    pub fn is_removal_pending(&self, id: &UniqueId) -> bool {
        self.removes.contains_key(id)
    }

    /// Stages a record for insertion, returning the pending add it replaced.
    pub fn stage_add(&mut self, record: R) -> Option<R> {
        self.adds.insert(record.unique_id().clone(), record)
    }

    /// Drops the pending add for an id.
    pub fn cancel_add(&mut self, id: &UniqueId) -> Option<R> {
        self.adds.remove(id)
    }

    /// Stages a committed record for removal.
    ///
    /// Staging the same id twice keeps the first record.
    pub fn stage_remove(&mut self, record: R) {
        self.removes
            .entry(record.unique_id().clone())
            .or_insert(record);
    }

    /// Requests that the index be cleared before the batch is applied.
    pub fn request_wipe(&mut self) {
        self.wipe = true;
    }

    /// Returns true if a wipe was requested.
    pub fn wipe_requested(&self) -> bool {
        self.wipe
    }

    /// Number of pending adds.
    pub fn add_count(&self) -> usize {
        self.adds.len()
    }

    /// Number of pending removes.
    pub fn remove_count(&self) -> usize {
        self.removes.len()
    }

    /// Returns true if nothing is staged and no wipe was requested.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && !self.wipe
    }

    /// Consumes the buffer into `(wipe, removes, adds)`.
    ///
    /// When a wipe was requested the removes are dropped, since clearing
    /// the index already removes every committed record.
    pub fn into_batch(self) -> (bool, Vec<R>, Vec<R>) {
        let removes = if self.wipe {
            Vec::new()
        } else {
            self.removes.into_values().collect()
        };
        (self.wipe, removes, self.adds.into_values().collect())
    }
}

impl<R: SyncRecord> Default for StagingBuffer<R> {
    fn default() -> Self {
        Self::new()
    }
}
