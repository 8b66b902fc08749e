//! Instrumented index store.

use parking_lot::Mutex;
use replidx_engine::{IndexStore, MemoryIndexStore, SyncError, SyncRecord, SyncResult, UniqueId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A [`MemoryIndexStore`] that counts calls and can be told to fail.
pub struct InstrumentedStore<R> {
    inner: MemoryIndexStore<R>,
    lookups: AtomicU64,
    applies: AtomicU64,
    fail_lookups: AtomicBool,
    fail_applies: AtomicBool,
    looked_up: Mutex<Vec<UniqueId>>,
}

impl<R: SyncRecord> InstrumentedStore<R> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::wrap(MemoryIndexStore::new())
    }

    /// Wraps an existing memory store.
    pub fn wrap(inner: MemoryIndexStore<R>) -> Self {
        Self {
            inner,
            lookups: AtomicU64::new(0),
            applies: AtomicU64::new(0),
            fail_lookups: AtomicBool::new(false),
            fail_applies: AtomicBool::new(false),
            looked_up: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &MemoryIndexStore<R> {
        &self.inner
    }

    /// Number of lookups served or refused.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Ids looked up, in call order.
    pub fn looked_up(&self) -> Vec<UniqueId> {
        self.looked_up.lock().clone()
    }

    /// Number of batches applied or refused.
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    /// Makes every subsequent lookup fail.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent batch apply fail.
    pub fn set_fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    fn check_apply(&self) -> SyncResult<()> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if self.fail_applies.load(Ordering::SeqCst) {
            return Err(SyncError::commit("injected apply failure"));
        }
        Ok(())
    }
}

impl<R: SyncRecord> Default for InstrumentedStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: SyncRecord> std::ops::Deref for InstrumentedStore<R> {
    type Target = MemoryIndexStore<R>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<R: SyncRecord> IndexStore<R> for InstrumentedStore<R> {
    fn lookup_by_unique_id(&self, id: &UniqueId) -> SyncResult<Option<R>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.looked_up.lock().push(id.clone());
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(SyncError::lookup(id, "injected lookup failure"));
        }
        self.inner.lookup_by_unique_id(id)
    }

    fn clear(&self) -> SyncResult<()> {
        self.inner.clear()
    }

    fn update(&self, to_remove: &[R], to_add: &[R]) -> SyncResult<()> {
        self.check_apply()?;
        self.inner.update(to_remove, to_add)
    }

    fn query(&self, predicate: &dyn Fn(&R) -> bool) -> SyncResult<Vec<R>> {
        self.inner.query(predicate)
    }

    fn apply(&self, wipe: bool, to_remove: &[R], to_add: &[R]) -> SyncResult<()> {
        self.check_apply()?;
        self.inner.apply(wipe, to_remove, to_add)
    }
}
