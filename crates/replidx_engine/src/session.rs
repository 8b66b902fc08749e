//! Sync target and pass lifecycle.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::lock::{ExclusivityLock, LockToken};
use crate::resolver::{ConflictResolver, Resolution};
use crate::staging::StagingBuffer;
use crate::store::IndexStore;
use crate::types::{InstanceId, OriginatorRef, Outcome, SyncRecord, Timestamp, UniqueId};
use crate::watermark::{Watermark, WatermarkStore};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Turns a raw payload into a record, given the per-pass context.
///
/// Returning `None` means the payload does not yield a record; the event is
/// then treated as "no record" rather than as an error.
pub type RecordMapper<R, C> = Box<dyn Fn(&C, &OriginatorRef, &[u8]) -> Option<R> + Send + Sync>;

/// Cumulative statistics of a sync target.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Number of passes whose batch reached the index.
    ///
    /// Includes a pass whose watermark write failed afterwards; its error
    /// is kept in `last_error`.
    pub passes_committed: u64,
    /// Number of passes aborted, explicitly or by failure.
    pub passes_aborted: u64,
    /// Events that staged a new record in committed passes.
    pub records_added: u64,
    /// Events that staged a replacement in committed passes.
    pub records_updated: u64,
    /// Events that staged a removal in committed passes.
    pub records_removed: u64,
    /// Events that staged nothing in committed passes.
    pub events_ignored: u64,
    /// Index lookups issued by conflict resolution, across all passes.
    pub lookups: u64,
    /// Time of the last successful commit.
    pub last_commit_time: Option<Instant>,
    /// Message of the last abort or failure.
    pub last_error: Option<String>,
}

/// Result of a committed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    /// Instance the pass synchronized.
    pub instance: InstanceId,
    /// Events with outcome [`Outcome::Added`].
    pub added: u64,
    /// Events with outcome [`Outcome::Updated`].
    pub updated: u64,
    /// Events with outcome [`Outcome::Removed`].
    pub removed: u64,
    /// Events with outcome [`Outcome::None`].
    pub ignored: u64,
    /// Whether the index was cleared before applying the pass.
    pub wiped: bool,
    /// Wall time from start to commit.
    pub duration: Duration,
}

impl PassSummary {
    fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            added: 0,
            updated: 0,
            removed: 0,
            ignored: 0,
            wiped: false,
            duration: Duration::ZERO,
        }
    }

    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Added => self.added += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Removed => self.removed += 1,
            Outcome::None => self.ignored += 1,
        }
    }
}

/// Where the end of a feed tells the engine to resume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEnd {
    /// Selection criteria to store for the next pass.
    pub selection_formula: String,
    /// Timestamp the next pass should start from.
    pub next_start: Timestamp,
}

impl FeedEnd {
    /// Creates a feed end marker.
    pub fn new(selection_formula: impl Into<String>, next_start: Timestamp) -> Self {
        Self {
            selection_formula: selection_formula.into(),
            next_start,
        }
    }
}

/// The per-event entry points a source feed calls during a pass.
///
/// Implemented by [`SyncSession`]; feeds are written against this trait so
/// they do not depend on the record, context or store types of a target.
pub trait ChangeSink {
    /// Instance the current pass synchronizes.
    fn instance(&self) -> &InstanceId;

    /// Requests that the index be cleared when the pass commits.
    fn wipe(&mut self);

    /// Reports that a record matches the selection criteria.
    fn record_matches(&mut self, origin: &OriginatorRef, payload: &[u8]) -> SyncResult<Outcome>;

    /// Reports that a record no longer matches the selection criteria.
    fn record_no_longer_matches(&mut self, origin: &OriginatorRef) -> SyncResult<Outcome>;

    /// Reports that a record was deleted at the source.
    fn record_deleted(&mut self, origin: &OriginatorRef) -> SyncResult<Outcome>;
}

/// Iterates a source's change set for one pass.
pub trait SourceFeed {
    /// Reports every change since `watermark` to `sink`.
    ///
    /// `watermark` is `None` when no pass has committed for the instance
    /// yet, in which case the feed must report a full scan.
    fn drive(
        &mut self,
        sink: &mut dyn ChangeSink,
        watermark: Option<&Watermark>,
    ) -> SyncResult<FeedEnd>;
}

/// A materialized index kept in sync with a change feed.
///
/// Passes against one target are serialized by an [`ExclusivityLock`];
/// passes against different targets are independent.
pub struct SyncTarget<R, C, S, W>
where
    R: SyncRecord,
    S: IndexStore<R>,
    W: WatermarkStore,
{
    config: SyncConfig,
    store: S,
    watermarks: W,
    mapper: RecordMapper<R, C>,
    resolver: ConflictResolver,
    lock: ExclusivityLock,
    initial_sync_completed: AtomicBool,
    stats: RwLock<SyncStats>,
}

impl<R, C, S, W> SyncTarget<R, C, S, W>
where
    R: SyncRecord,
    S: IndexStore<R>,
    W: WatermarkStore,
{
    /// Creates a new sync target.
    pub fn new<F>(config: SyncConfig, store: S, watermarks: W, mapper: F) -> Self
    where
        F: Fn(&C, &OriginatorRef, &[u8]) -> Option<R> + Send + Sync + 'static,
    {
        Self {
            resolver: ConflictResolver::new(config.tie_break),
            initial_sync_completed: AtomicBool::new(config.initial_sync_completed),
            config,
            store,
            watermarks,
            mapper: Box::new(mapper),
            lock: ExclusivityLock::new(),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the materialized index.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Gets the watermark store.
    pub fn watermarks(&self) -> &W {
        &self.watermarks
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true once a pass has committed.
    pub fn is_initial_sync_completed(&self) -> bool {
        self.initial_sync_completed.load(Ordering::SeqCst)
    }

    /// Returns true while a pass holds the target's lock.
    pub fn is_pass_running(&self) -> bool {
        self.lock.is_held()
    }

    /// Starts a pass for `instance`, blocking until no other pass is running.
    ///
    /// The returned session must be ended with [`SyncSession::commit`] or
    /// [`SyncSession::abort`]; dropping it aborts.
    pub fn start(&self, instance: InstanceId, context: C) -> SyncSession<'_, R, C, S, W> {
        let token = self.lock.acquire();
        info!(sync_target = %self.config.target_name, instance = %instance, "sync pass started");

        SyncSession {
            target: self,
            summary: PassSummary::new(instance),
            context,
            staging: StagingBuffer::new(),
            lookups: 0,
            failure: None,
            started: Instant::now(),
            finished: false,
            _token: token,
        }
    }

    /// Runs one complete pass driven by `feed`.
    ///
    /// Commits if the feed completes and aborts if it fails.
    pub fn run_pass<F: SourceFeed + ?Sized>(
        &self,
        instance: InstanceId,
        context: C,
        feed: &mut F,
    ) -> SyncResult<PassSummary> {
        let mut session = self.start(instance.clone(), context);

        let watermark = match self.watermarks.get(&instance) {
            Ok(watermark) => watermark,
            Err(e) => {
                session.abort(&e);
                return Err(e);
            }
        };

        if watermark.is_none() {
            debug!(instance = %instance, "no watermark, requesting full scan");
        }

        match feed.drive(&mut session, watermark.as_ref()) {
            Ok(end) => session.commit(&end.selection_formula, &instance, end.next_start),
            Err(e) => {
                session.abort(&e);
                Err(e)
            }
        }
    }

    fn record_commit(&self, summary: &PassSummary, lookups: u64, error: Option<String>) {
        let mut stats = self.stats.write();
        stats.passes_committed += 1;
        stats.records_added += summary.added;
        stats.records_updated += summary.updated;
        stats.records_removed += summary.removed;
        stats.events_ignored += summary.ignored;
        stats.lookups += lookups;
        stats.last_commit_time = Some(Instant::now());
        stats.last_error = error;
    }

    fn record_abort(&self, reason: String, lookups: u64) {
        let mut stats = self.stats.write();
        stats.passes_aborted += 1;
        stats.lookups += lookups;
        stats.last_error = Some(reason);
    }
}

/// One running synchronization pass.
///
/// The session owns the staged state of the pass and the target's lock.
/// It is an explicit value rather than thread-local state, so it may be
/// moved to another thread between calls.
pub struct SyncSession<'a, R, C, S, W>
where
    R: SyncRecord,
    S: IndexStore<R>,
    W: WatermarkStore,
{
    target: &'a SyncTarget<R, C, S, W>,
    summary: PassSummary,
    context: C,
    staging: StagingBuffer<R>,
    lookups: u64,
    failure: Option<String>,
    started: Instant,
    finished: bool,
    _token: LockToken<'a>,
}

impl<'a, R, C, S, W> SyncSession<'a, R, C, S, W>
where
    R: SyncRecord,
    S: IndexStore<R>,
    W: WatermarkStore,
{
    /// Instance this pass synchronizes.
    pub fn instance(&self) -> &InstanceId {
        &self.summary.instance
    }

    /// Per-pass context handed to the record mapper.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Gets the staged state of the pass.
    pub fn staging(&self) -> &StagingBuffer<R> {
        &self.staging
    }

    /// Requests that the index be cleared when the pass commits.
    ///
    /// Idempotent. Once requested, the index is no longer consulted for
    /// conflict resolution during this pass.
    pub fn wipe(&mut self) {
        if !self.staging.wipe_requested() {
            debug!(instance = %self.summary.instance, "wipe requested");
        }
        self.staging.request_wipe();
    }

    /// Reports that a record matches the selection criteria.
    ///
    /// # Errors
    ///
    /// Returns an error if the index lookup fails. The session is then
    /// failed and can only be aborted; committing it aborts as well.
    pub fn record_matches(&mut self, origin: &OriginatorRef, payload: &[u8]) -> SyncResult<Outcome> {
        self.check_failed()?;
        let target = self.target;
        let context = &self.context;
        let store = LookupCounter::new(&target.store);

        let resolution = target.resolver.resolve_matches(
            &store,
            &self.staging,
            self.lookups_enabled(),
            origin,
            || (target.mapper)(context, origin, payload),
        );
        self.lookups += store.count();
        self.stage(origin, resolution)
    }

    /// Reports that a record no longer matches the selection criteria.
    pub fn record_no_longer_matches(&mut self, origin: &OriginatorRef) -> SyncResult<Outcome> {
        self.record_removal(origin)
    }

    /// Reports that a record was deleted at the source.
    pub fn record_deleted(&mut self, origin: &OriginatorRef) -> SyncResult<Outcome> {
        self.record_removal(origin)
    }

    /// Applies the staged pass to the index and advances the watermark.
    ///
    /// An empty batch leaves the index alone. If the index rejects the
    /// batch, nothing is applied, the watermark is not advanced and the
    /// error is returned. The lock is released in every case.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InstanceMismatch`] if `instance` differs from the one
    ///   the pass was started with
    /// - A commit failure from the index store
    /// - A watermark store failure; the index has been updated by then and
    ///   the pass counts as committed in [`SyncStats`], and the next pass
    ///   replays the same range, which is harmless
    pub fn commit(
        mut self,
        next_selection_formula: &str,
        instance: &InstanceId,
        next_start: Timestamp,
    ) -> SyncResult<PassSummary> {
        self.finished = true;
        let target = self.target;

        if let Some(reason) = self.failure.take() {
            let err = SyncError::Poisoned(reason);
            self.fail(&err);
            return Err(err);
        }

        if instance != &self.summary.instance {
            let err = SyncError::InstanceMismatch {
                started: self.summary.instance.clone(),
                committed: instance.clone(),
            };
            self.fail(&err);
            return Err(err);
        }

        let (wipe, removes, adds) = std::mem::take(&mut self.staging).into_batch();
        let unchanged = !wipe && removes.is_empty() && adds.is_empty();
        if !unchanged {
            if let Err(e) = target.store.apply(wipe, &removes, &adds) {
                self.fail(&e);
                return Err(e);
            }
        }
        target.initial_sync_completed.store(true, Ordering::SeqCst);

        self.summary.wiped = wipe;
        self.summary.duration = self.started.elapsed();

        if let Err(e) = target
            .watermarks
            .set(instance, next_selection_formula, next_start)
        {
            warn!(
                sync_target = %target.config.target_name,
                instance = %instance,
                error = %e,
                "index updated but watermark not advanced, next pass replays the range"
            );
            target.record_commit(&self.summary, self.lookups, Some(e.to_string()));
            return Err(e);
        }

        target.record_commit(&self.summary, self.lookups, None);

        info!(
            sync_target = %target.config.target_name,
            instance = %instance,
            added = self.summary.added,
            updated = self.summary.updated,
            removed = self.summary.removed,
            ignored = self.summary.ignored,
            wiped = wipe,
            "sync pass committed"
        );
        Ok(self.summary.clone())
    }

    /// Discards the staged pass and releases the lock.
    ///
    /// The index and watermarks are left exactly as they were before the
    /// pass started.
    pub fn abort(mut self, reason: impl std::fmt::Display) {
        self.finished = true;
        let reason = reason.to_string();
        warn!(
            sync_target = %self.target.config.target_name,
            instance = %self.summary.instance,
            reason = %reason,
            "sync pass aborted"
        );
        self.target.record_abort(reason, self.lookups);
    }

    fn record_removal(&mut self, origin: &OriginatorRef) -> SyncResult<Outcome> {
        self.check_failed()?;
        let target = self.target;
        let store = LookupCounter::new(&target.store);

        let resolution = target.resolver.resolve_removal(
            &store,
            &self.staging,
            self.lookups_enabled(),
            origin,
        );
        self.lookups += store.count();
        self.stage(origin, resolution)
    }

    fn lookups_enabled(&self) -> bool {
        self.target.is_initial_sync_completed() && !self.staging.wipe_requested()
    }

    fn stage(
        &mut self,
        origin: &OriginatorRef,
        resolution: SyncResult<Resolution<R>>,
    ) -> SyncResult<Outcome> {
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(unique_id = %origin.unique_id, error = %e, "conflict resolution failed");
                self.failure = Some(e.to_string());
                return Err(e);
            }
        };

        let outcome = resolution.outcome();
        match &resolution {
            Resolution::Stale { current_sequence } if origin.sequence < *current_sequence => {
                warn!(
                    unique_id = %origin.unique_id,
                    sequence = origin.sequence,
                    current_sequence = *current_sequence,
                    instance = %origin.source_instance_id,
                    "stale change suppressed"
                );
            }
            _ => {
                debug!(
                    unique_id = %origin.unique_id,
                    sequence = origin.sequence,
                    instance = %origin.source_instance_id,
                    outcome = ?outcome,
                    "staged change"
                );
            }
        }
        resolution.stage(&mut self.staging, &origin.unique_id);
        self.summary.count(outcome);
        Ok(outcome)
    }

    fn check_failed(&self) -> SyncResult<()> {
        match &self.failure {
            Some(reason) => Err(SyncError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: &SyncError) {
        warn!(
            sync_target = %self.target.config.target_name,
            instance = %self.summary.instance,
            error = %error,
            "sync pass failed, staged changes discarded"
        );
        self.target.record_abort(error.to_string(), self.lookups);
    }
}

impl<R, C, S, W> ChangeSink for SyncSession<'_, R, C, S, W>
where
    R: SyncRecord,
    S: IndexStore<R>,
    W: WatermarkStore,
{
    fn instance(&self) -> &InstanceId {
        SyncSession::instance(self)
    }

    fn wipe(&mut self) {
        SyncSession::wipe(self)
    }

    fn record_matches(&mut self, origin: &OriginatorRef, payload: &[u8]) -> SyncResult<Outcome> {
        SyncSession::record_matches(self, origin, payload)
    }

    fn record_no_longer_matches(&mut self, origin: &OriginatorRef) -> SyncResult<Outcome> {
        SyncSession::record_no_longer_matches(self, origin)
    }

    fn record_deleted(&mut self, origin: &OriginatorRef) -> SyncResult<Outcome> {
        SyncSession::record_deleted(self, origin)
    }
}

impl<R, C, S, W> Drop for SyncSession<'_, R, C, S, W>
where
    R: SyncRecord,
    S: IndexStore<R>,
    W: WatermarkStore,
{
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                sync_target = %self.target.config.target_name,
                instance = %self.summary.instance,
                "sync pass dropped without commit or abort, discarding staged changes"
            );
            self.target
                .record_abort("pass dropped without commit".into(), self.lookups);
        }
    }
}

/// Index store view that counts the lookups issued through it.
struct LookupCounter<'s, S> {
    inner: &'s S,
    lookups: AtomicU64,
}

impl<'s, S> LookupCounter<'s, S> {
    fn new(inner: &'s S) -> Self {
        Self {
            inner,
            lookups: AtomicU64::new(0),
        }
    }

    fn count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl<R: SyncRecord, S: IndexStore<R>> IndexStore<R> for LookupCounter<'_, S> {
    fn lookup_by_unique_id(&self, id: &UniqueId) -> SyncResult<Option<R>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.inner.lookup_by_unique_id(id)
    }

    fn clear(&self) -> SyncResult<()> {
        self.inner.clear()
    }

    fn update(&self, to_remove: &[R], to_add: &[R]) -> SyncResult<()> {
        self.inner.update(to_remove, to_add)
    }

    fn query(&self, predicate: &dyn Fn(&R) -> bool) -> SyncResult<Vec<R>> {
        self.inner.query(predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryIndexStore;
    use crate::watermark::MemoryWatermarkStore;

    #[derive(Debug, Clone, PartialEq)]
    struct Doc {
        id: UniqueId,
        seq: u64,
        body: String,
    }

    impl SyncRecord for Doc {
        fn unique_id(&self) -> &UniqueId {
            &self.id
        }
        fn sequence(&self) -> u64 {
            self.seq
        }
        fn sequence_time(&self) -> Timestamp {
            Timestamp::EPOCH
        }
    }

    type Target = SyncTarget<Doc, (), MemoryIndexStore<Doc>, MemoryWatermarkStore>;

    fn make_target() -> Target {
        SyncTarget::new(
            SyncConfig::new("docs"),
            MemoryIndexStore::new(),
            MemoryWatermarkStore::new(),
            |_: &(), origin: &OriginatorRef, payload: &[u8]| {
                let body = std::str::from_utf8(payload).ok()?;
                (body != "skip").then(|| Doc {
                    id: origin.unique_id.clone(),
                    seq: origin.sequence,
                    body: body.to_string(),
                })
            },
        )
    }

    fn replica() -> InstanceId {
        InstanceId::new("r1")
    }

    fn origin(id: &str, seq: u64) -> OriginatorRef {
        OriginatorRef::new(id, seq, Timestamp::EPOCH, replica())
    }

    fn commit_one(target: &Target, id: &str, seq: u64) {
        let mut session = target.start(replica(), ());
        session.record_matches(&origin(id, seq), b"v").unwrap();
        session
            .commit("f", &replica(), Timestamp::from_millis(seq))
            .unwrap();
    }

    #[test]
    fn commit_applies_and_advances_watermark() {
        let target = make_target();
        let mut session = target.start(replica(), ());
        assert!(target.is_pass_running());

        assert_eq!(
            session.record_matches(&origin("a", 1), b"hello").unwrap(),
            Outcome::Added
        );
        assert!(target.store().is_empty());

        let summary = session
            .commit("SELECT @All", &replica(), Timestamp::from_millis(10))
            .unwrap();
        assert_eq!(summary.added, 1);
        assert!(!target.is_pass_running());
        assert!(target.is_initial_sync_completed());

        let mark = target.watermarks().get(&replica()).unwrap().unwrap();
        assert_eq!(mark.selection_formula, "SELECT @All");
        assert_eq!(mark.last_end_timestamp, Timestamp::from_millis(10));
        assert_eq!(target.store().get(&UniqueId::new("a")).unwrap().body, "hello");
    }

    #[test]
    fn abort_leaves_store_and_watermarks_untouched() {
        let target = make_target();
        commit_one(&target, "a", 1);

        let mut session = target.start(replica(), ());
        session.wipe();
        session.record_matches(&origin("b", 1), b"x").unwrap();
        session.record_deleted(&origin("a", 1)).unwrap();
        session.abort("user cancelled");

        assert_eq!(target.store().snapshot().len(), 1);
        assert!(target.store().get(&UniqueId::new("a")).is_some());
        let mark = target.watermarks().get(&replica()).unwrap().unwrap();
        assert_eq!(mark.last_end_timestamp, Timestamp::from_millis(1));

        let stats = target.stats();
        assert_eq!(stats.passes_aborted, 1);
        assert_eq!(stats.last_error.as_deref(), Some("user cancelled"));
    }

    #[test]
    fn dropped_session_counts_as_abort() {
        let target = make_target();
        {
            let mut session = target.start(replica(), ());
            session.record_matches(&origin("a", 1), b"x").unwrap();
        }

        assert!(!target.is_pass_running());
        assert!(target.store().is_empty());
        assert_eq!(target.stats().passes_aborted, 1);
    }

    #[test]
    fn update_replaces_committed_record() {
        let target = make_target();
        commit_one(&target, "a", 5);

        let mut session = target.start(replica(), ());
        assert_eq!(
            session.record_matches(&origin("a", 7), b"new").unwrap(),
            Outcome::Updated
        );
        assert_eq!(session.staging().remove_count(), 1);
        assert_eq!(session.staging().add_count(), 1);
        session.commit("f", &replica(), Timestamp::from_millis(7)).unwrap();

        let stored = target.store().get(&UniqueId::new("a")).unwrap();
        assert_eq!(stored.seq, 7);
        assert_eq!(target.store().len(), 1);
    }

    #[test]
    fn unmappable_payload_removes_superseded_record() {
        let target = make_target();
        commit_one(&target, "a", 1);

        let mut session = target.start(replica(), ());
        assert_eq!(
            session.record_matches(&origin("a", 2), b"skip").unwrap(),
            Outcome::Removed
        );
        session.commit("f", &replica(), Timestamp::from_millis(2)).unwrap();
        assert!(target.store().is_empty());
    }

    #[test]
    fn first_pass_issues_no_lookups() {
        let target = make_target();
        let mut session = target.start(replica(), ());
        session.record_matches(&origin("a", 1), b"x").unwrap();
        session.record_deleted(&origin("zz", 1)).unwrap();
        session.commit("f", &replica(), Timestamp::EPOCH).unwrap();
        assert_eq!(target.stats().lookups, 0);

        let mut session = target.start(replica(), ());
        session.record_matches(&origin("b", 1), b"x").unwrap();
        session.commit("f", &replica(), Timestamp::EPOCH).unwrap();
        assert_eq!(target.stats().lookups, 1);
    }

    #[test]
    fn seeded_target_resolves_from_first_pass() {
        let target = SyncTarget::new(
            SyncConfig::new("docs").with_initial_sync_completed(true),
            MemoryIndexStore::with_records([Doc {
                id: UniqueId::new("a"),
                seq: 3,
                body: "old".into(),
            }]),
            MemoryWatermarkStore::new(),
            |_: &(), origin: &OriginatorRef, _: &[u8]| {
                Some(Doc {
                    id: origin.unique_id.clone(),
                    seq: origin.sequence,
                    body: String::new(),
                })
            },
        );

        let mut session = target.start(replica(), ());
        assert_eq!(
            session.record_matches(&origin("a", 3), b"").unwrap(),
            Outcome::None
        );
        session.abort("done");
    }

    #[test]
    fn commit_for_other_instance_is_rejected() {
        let target = make_target();
        let mut session = target.start(replica(), ());
        session.record_matches(&origin("a", 1), b"x").unwrap();

        let err = session
            .commit("f", &InstanceId::new("other"), Timestamp::EPOCH)
            .unwrap_err();
        assert!(matches!(err, SyncError::InstanceMismatch { .. }));
        assert!(target.store().is_empty());
        assert!(target.watermarks().get(&replica()).unwrap().is_none());
        assert!(!target.is_pass_running());
    }

    #[test]
    fn rejected_commit_keeps_watermark() {
        let target = make_target();
        commit_one(&target, "a", 1);

        // Stage a second record for a committed id without removing it.
        let mut session = target.start(replica(), ());
        session.record_matches(&origin("b", 1), b"x").unwrap();
        session.staging.stage_add(Doc {
            id: UniqueId::new("a"),
            seq: 9,
            body: "dup".into(),
        });

        let err = session
            .commit("g", &replica(), Timestamp::from_millis(99))
            .unwrap_err();
        assert!(err.is_commit_failure());
        assert_eq!(target.store().len(), 1);
        let mark = target.watermarks().get(&replica()).unwrap().unwrap();
        assert_eq!(mark.selection_formula, "f");
        assert_eq!(target.stats().passes_aborted, 1);
    }

    struct UnwritableMarks;

    impl WatermarkStore for UnwritableMarks {
        fn get(&self, _: &InstanceId) -> SyncResult<Option<Watermark>> {
            Ok(None)
        }

        fn set(&self, _: &InstanceId, _: &str, _: Timestamp) -> SyncResult<()> {
            Err(SyncError::Watermark("disk full".into()))
        }

        fn last_instance_synced(&self) -> SyncResult<Option<InstanceId>> {
            Ok(None)
        }

        fn forget(&self, _: &InstanceId) -> SyncResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn failed_watermark_write_counts_applied_pass() {
        let target = SyncTarget::new(
            SyncConfig::new("docs"),
            MemoryIndexStore::new(),
            UnwritableMarks,
            |_: &(), origin: &OriginatorRef, _: &[u8]| {
                Some(Doc {
                    id: origin.unique_id.clone(),
                    seq: origin.sequence,
                    body: String::new(),
                })
            },
        );

        let mut session = target.start(replica(), ());
        session.record_matches(&origin("a", 1), b"x").unwrap();
        let err = session
            .commit("f", &replica(), Timestamp::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, SyncError::Watermark(_)));

        assert_eq!(target.store().len(), 1);
        assert!(target.is_initial_sync_completed());
        assert!(!target.is_pass_running());
        let stats = target.stats();
        assert_eq!(stats.passes_committed, 1);
        assert_eq!(stats.passes_aborted, 0);
        assert_eq!(stats.records_added, 1);
        assert_eq!(stats.last_error.as_deref(), Some("watermark store error: disk full"));
    }

    #[test]
    fn wipe_is_idempotent() {
        let target = make_target();
        commit_one(&target, "a", 1);

        let mut session = target.start(replica(), ());
        session.wipe();
        session.wipe();
        session.record_matches(&origin("b", 1), b"x").unwrap();
        let summary = session.commit("f", &replica(), Timestamp::EPOCH).unwrap();

        assert!(summary.wiped);
        assert_eq!(target.store().snapshot().len(), 1);
        assert!(target.store().get(&UniqueId::new("b")).is_some());
    }

    #[test]
    fn session_can_finish_on_another_thread() {
        let target = make_target();
        let mut session = target.start(replica(), ());
        session.record_matches(&origin("a", 1), b"x").unwrap();

        std::thread::scope(|scope| {
            scope
                .spawn(move || {
                    session.commit("f", &replica(), Timestamp::EPOCH).unwrap();
                })
                .join()
                .unwrap();
        });

        assert_eq!(target.store().len(), 1);
        assert!(!target.is_pass_running());
    }
}
