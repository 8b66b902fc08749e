//! Materialized index store abstraction.

use crate::error::{SyncError, SyncResult};
use crate::types::{SyncRecord, UniqueId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The queryable collection a sync target materializes into.
///
/// The engine only ever mutates the store from a commit, under the
/// target's exclusivity lock. Implementations must make
/// [`update`](Self::update) atomic with respect to concurrent readers:
/// either the whole batch is visible or none of it is.
pub trait IndexStore<R: SyncRecord>: Send + Sync {
    /// Looks up the record with the given id by exact match.
    fn lookup_by_unique_id(&self, id: &UniqueId) -> SyncResult<Option<R>>;

    /// Removes every record.
    fn clear(&self) -> SyncResult<()>;

    /// Removes `to_remove` then inserts `to_add` as one atomic step.
    fn update(&self, to_remove: &[R], to_add: &[R]) -> SyncResult<()>;

    /// Returns every record matching the predicate.
    ///
    /// Used by consumers of the index, never by the engine.
    fn query(&self, predicate: &dyn Fn(&R) -> bool) -> SyncResult<Vec<R>>;

    /// Applies the batch of one committed pass as a single
    /// [`update`](Self::update).
    ///
    /// When `wipe` is set the default removes every current record in that
    /// same update instead of calling [`clear`](Self::clear) first, so a
    /// rejected batch leaves the store untouched. Stores with a cheaper
    /// atomic wipe should override this.
    fn apply(&self, wipe: bool, to_remove: &[R], to_add: &[R]) -> SyncResult<()> {
        if wipe {
            let current = self.query(&|_| true)?;
            return self.update(&current, to_add);
        }
        self.update(to_remove, to_add)
    }
}

impl<R: SyncRecord, S: IndexStore<R> + ?Sized> IndexStore<R> for Arc<S> {
    fn lookup_by_unique_id(&self, id: &UniqueId) -> SyncResult<Option<R>> {
        (**self).lookup_by_unique_id(id)
    }

    fn clear(&self) -> SyncResult<()> {
        (**self).clear()
    }

    fn update(&self, to_remove: &[R], to_add: &[R]) -> SyncResult<()> {
        (**self).update(to_remove, to_add)
    }

    fn query(&self, predicate: &dyn Fn(&R) -> bool) -> SyncResult<Vec<R>> {
        (**self).query(predicate)
    }

    fn apply(&self, wipe: bool, to_remove: &[R], to_add: &[R]) -> SyncResult<()> {
        (**self).apply(wipe, to_remove, to_add)
    }
}

/// An in-memory index keyed by unique id.
///
/// # Invariants
///
/// - At most one record per unique id
/// - A batch that would break the invariant is rejected whole
pub struct MemoryIndexStore<R> {
    records: RwLock<HashMap<UniqueId, R>>,
}

impl<R: SyncRecord> MemoryIndexStore<R> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a store holding the given records.
    ///
    /// Later records replace earlier ones with the same id.
    pub fn with_records(records: impl IntoIterator<Item = R>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.unique_id().clone(), record))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Returns the record with the given id.
    pub fn get(&self, id: &UniqueId) -> Option<R> {
        self.records.read().get(id).cloned()
    }

    /// Returns all records ordered by unique id.
    pub fn snapshot(&self) -> Vec<R> {
        let mut records: Vec<R> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.unique_id().cmp(b.unique_id()));
        records
    }

    fn check_batch(
        records: &HashMap<UniqueId, R>,
        wipe: bool,
        to_remove: &[R],
        to_add: &[R],
    ) -> SyncResult<()> {
        let removed: HashSet<&UniqueId> = to_remove.iter().map(|r| r.unique_id()).collect();
        let mut added = HashSet::with_capacity(to_add.len());

        for record in to_add {
            let id = record.unique_id();
            let still_present = !wipe && records.contains_key(id) && !removed.contains(id);
            if still_present || !added.insert(id) {
                return Err(SyncError::DuplicateKey(id.clone()));
            }
        }
        Ok(())
    }

    fn apply_locked(
        records: &mut HashMap<UniqueId, R>,
        wipe: bool,
        to_remove: &[R],
        to_add: &[R],
    ) -> SyncResult<()> {
        Self::check_batch(records, wipe, to_remove, to_add)?;

        if wipe {
            records.clear();
        }
        for record in to_remove {
            records.remove(record.unique_id());
        }
        for record in to_add {
            records.insert(record.unique_id().clone(), record.clone());
        }
        Ok(())
    }
}

impl<R: SyncRecord> Default for MemoryIndexStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: SyncRecord> IndexStore<R> for MemoryIndexStore<R> {
    fn lookup_by_unique_id(&self, id: &UniqueId) -> SyncResult<Option<R>> {
        Ok(self.get(id))
    }

    fn clear(&self) -> SyncResult<()> {
        self.records.write().clear();
        Ok(())
    }

    fn update(&self, to_remove: &[R], to_add: &[R]) -> SyncResult<()> {
        Self::apply_locked(&mut self.records.write(), false, to_remove, to_add)
    }

    fn query(&self, predicate: &dyn Fn(&R) -> bool) -> SyncResult<Vec<R>> {
        let mut matches: Vec<R> = self
            .records
            .read()
            .values()
            .filter(|record| predicate(record))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.unique_id().cmp(b.unique_id()));
        Ok(matches)
    }

    fn apply(&self, wipe: bool, to_remove: &[R], to_add: &[R]) -> SyncResult<()> {
        Self::apply_locked(&mut self.records.write(), wipe, to_remove, to_add)
    }
}
