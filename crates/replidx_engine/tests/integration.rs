//! Integration tests for the reconciliation engine.

use parking_lot::Mutex;
use replidx_engine::{
    FeedEnd, IndexStore, MemoryIndexStore, MemoryWatermarkStore, Outcome, RecordedFeed,
    SyncConfig, SyncError, SyncResult, SyncTarget, TieBreak, Timestamp, UniqueId, WatermarkStore,
};
use replidx_testkit::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const R1: &str = "replica-1";

fn id(s: &str) -> UniqueId {
    UniqueId::new(s)
}

fn commit_pass(target: &MemoTarget, feed: FeedBuilder) -> Vec<Outcome> {
    let mut feed = feed.build();
    target
        .run_pass(instance(R1), PassContext::default(), &mut feed)
        .unwrap();
    feed.outcomes().to_vec()
}

#[test]
fn idempotent_replay_is_ignored() {
    let target = memo_target();
    commit_pass(&target, FeedBuilder::new(R1).matches("a", 4, "Memo", "hi"));
    let applies = target.store().apply_count();

    let outcomes = commit_pass(&target, FeedBuilder::new(R1).matches("a", 4, "Memo", "hi"));

    assert_eq!(outcomes, vec![Outcome::None]);
    assert_eq!(target.store().get(&id("a")).unwrap().sequence, 4);
    assert_eq!(target.store().apply_count(), applies);
    assert_eq!(target.store().len(), 1);
}

#[test]
fn monotonic_replace() {
    let target = memo_target();
    commit_pass(&target, FeedBuilder::new(R1).matches("a", 5, "Memo", "old"));

    let mut session = target.start(instance(R1), PassContext::default());
    let outcome = session
        .record_matches(&origin("a", 7, R1), memo_payload("Memo", "new").as_bytes())
        .unwrap();
    assert_eq!(outcome, Outcome::Updated);
    assert_eq!(session.staging().remove_count(), 1);
    assert_eq!(session.staging().add_count(), 1);
    assert!(session.staging().is_removal_pending(&id("a")));
    assert_eq!(session.staging().pending_add(&id("a")).unwrap().sequence, 7);
    session
        .commit("SELECT @All", &instance(R1), Timestamp::from_millis(2))
        .unwrap();

    let stored = target.store().snapshot();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sequence, 7);
    assert_eq!(stored[0].subject, "new");
}

#[test]
fn stale_suppression() {
    let target = memo_target();
    commit_pass(&target, FeedBuilder::new(R1).matches("a", 5, "Memo", "current"));

    let mut session = target.start(instance(R1), PassContext::default());
    let outcome = session
        .record_matches(&origin("a", 3, R1), memo_payload("Memo", "stale").as_bytes())
        .unwrap();

    assert_eq!(outcome, Outcome::None);
    assert!(session.staging().is_empty());
    session.abort("test complete");
}

#[test]
fn deletion_invariant() {
    let target = memo_target();
    commit_pass(&target, FeedBuilder::new(R1).matches("a", 9, "Memo", "x"));

    let mut session = target.start(instance(R1), PassContext::default());
    // Sequence is irrelevant to removal.
    assert_eq!(
        session.record_deleted(&origin("a", 1, R1)).unwrap(),
        Outcome::Removed
    );
    assert_eq!(session.staging().remove_count(), 1);
    assert_eq!(
        session.record_deleted(&origin("missing", 1, R1)).unwrap(),
        Outcome::None
    );
    assert_eq!(session.staging().remove_count(), 1);
    session
        .commit("SELECT @All", &instance(R1), Timestamp::from_millis(3))
        .unwrap();

    assert!(target.store().is_empty());
}

#[test]
fn wipe_replaces_all() {
    let target = memo_target();
    commit_pass(
        &target,
        FeedBuilder::new(R1)
            .matches("a", 1, "Memo", "a")
            .matches("b", 1, "Memo", "b")
            .matches("c", 1, "Memo", "c"),
    );

    let outcomes = commit_pass(
        &target,
        FeedBuilder::new(R1)
            .wipe()
            .matches("b", 1, "Memo", "b again")
            .matches("d", 2, "Memo", "d"),
    );

    assert_eq!(outcomes, vec![Outcome::None, Outcome::Added, Outcome::Added]);
    let ids: Vec<_> = target
        .store()
        .snapshot()
        .into_iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, vec!["b", "d"]);
}

#[test]
fn abort_safety_with_failing_feed() {
    let target = memo_target();
    commit_pass(
        &target,
        FeedBuilder::new(R1)
            .matches("a", 1, "Memo", "a")
            .matches("b", 1, "Memo", "b")
            .ending("SELECT Form = \"Memo\"", 100),
    );
    let before_store = target.store().snapshot();
    let before_marks = target.watermarks().snapshot();

    let events = FeedBuilder::new(R1)
        .matches("a", 2, "Memo", "changed")
        .deleted("b", 1)
        .wipe()
        .matches("c", 1, "Memo", "c")
        .events()
        .to_vec();
    let mut feed = FailingFeed::new(events, 4);

    let err = target
        .run_pass(instance(R1), PassContext::default(), &mut feed)
        .unwrap_err();

    assert!(matches!(err, SyncError::Feed(_)));
    assert_eq!(target.store().snapshot(), before_store);
    assert_eq!(target.watermarks().snapshot(), before_marks);
    assert!(!target.is_pass_running());
    assert_eq!(target.stats().passes_aborted, 1);
}

#[test]
fn initial_pass_bypasses_lookups() {
    let target = memo_target();
    commit_pass(
        &target,
        FeedBuilder::new(R1)
            .matches("a", 1, "Memo", "a")
            .matches("a", 2, "Memo", "a2")
            .no_longer_matches("b", 1)
            .deleted("c", 1),
    );
    assert_eq!(target.store().lookup_count(), 0);
    assert_eq!(target.store().get(&id("a")).unwrap().sequence, 2);

    commit_pass(&target, FeedBuilder::new(R1).matches("b", 1, "Memo", "b"));
    assert_eq!(target.store().looked_up(), vec![id("b")]);
}

#[test]
fn end_to_end_scenario() {
    let target = memo_target();

    let pass1 = commit_pass(&target, FeedBuilder::new(R1).matches("A", 1, "Memo", "first"));
    assert_eq!(pass1, vec![Outcome::Added]);
    assert!(target.store().get(&id("A")).is_some());

    let pass2 = commit_pass(&target, FeedBuilder::new(R1).no_longer_matches("A", 1));
    assert_eq!(pass2, vec![Outcome::Removed]);
    assert!(target.store().get(&id("A")).is_none());

    let pass3 = commit_pass(&target, FeedBuilder::new(R1).matches("A", 1, "Memo", "back"));
    assert_eq!(pass3, vec![Outcome::Added]);
    let memo = target.store().get(&id("A")).unwrap();
    assert_eq!(memo.sequence, 1);
    assert_eq!(memo.subject, "back");
}

#[test]
fn mutual_exclusion_serializes_passes() {
    let target = memo_target();
    let log = Mutex::new(Vec::new());
    let first_started = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut session = target.start(instance("first"), PassContext::default());
            log.lock().push("first start");
            first_started.store(true, Ordering::SeqCst);

            std::thread::sleep(Duration::from_millis(50));
            session
                .record_matches(&origin("a", 1, "first"), memo_payload("Memo", "1").as_bytes())
                .unwrap();
            session
                .commit("f", &instance("first"), Timestamp::from_millis(1))
                .unwrap();
            log.lock().push("first commit");
        });

        scope.spawn(|| {
            while !first_started.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            let mut session = target.start(instance("second"), PassContext::default());
            log.lock().push("second start");
            // The first pass has committed, so lookups run and see its record.
            let outcome = session
                .record_matches(&origin("a", 2, "second"), memo_payload("Memo", "2").as_bytes())
                .unwrap();
            assert_eq!(outcome, Outcome::Updated);
            session
                .commit("f", &instance("second"), Timestamp::from_millis(2))
                .unwrap();
            log.lock().push("second commit");
        });
    });

    assert_eq!(
        *log.lock(),
        vec!["first start", "first commit", "second start", "second commit"]
    );
    assert_eq!(target.store().get(&id("a")).unwrap().sequence, 2);
}

#[test]
fn separate_targets_do_not_block_each_other() {
    let contacts = memo_target_with(SyncConfig::new("contacts"));
    let calendar = memo_target_with(SyncConfig::new("calendar"));

    let held = contacts.start(instance(R1), PassContext::default());
    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                commit_pass(&calendar, FeedBuilder::new(R1).matches("e", 1, "Event", "standup"));
            })
            .join()
            .unwrap();
    });
    held.abort("done");

    assert_eq!(calendar.store().len(), 1);
    assert!(contacts.store().is_empty());
}

#[test]
fn lookup_failure_aborts_pass() {
    let target = memo_target();
    commit_pass(&target, FeedBuilder::new(R1).matches("a", 1, "Memo", "a"));
    target.store().set_fail_lookups(true);

    let mut session = target.start(instance(R1), PassContext::default());
    let err = session
        .record_matches(&origin("b", 1, R1), memo_payload("Memo", "b").as_bytes())
        .unwrap_err();
    assert!(matches!(err, SyncError::Lookup { .. }));

    // The pass is failed from here on.
    assert!(matches!(
        session.record_deleted(&origin("a", 1, R1)),
        Err(SyncError::Poisoned(_))
    ));
    let err = session
        .commit("later", &instance(R1), Timestamp::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, SyncError::Poisoned(_)));

    assert_eq!(target.store().len(), 1);
    let mark = target.watermarks().get(&instance(R1)).unwrap().unwrap();
    assert_eq!(mark.selection_formula, "SELECT @All");
    assert!(!target.is_pass_running());
}

#[test]
fn commit_failure_keeps_watermark_and_releases_lock() {
    let target = memo_target();
    commit_pass(
        &target,
        FeedBuilder::new(R1)
            .matches("a", 1, "Memo", "a")
            .ending("SELECT @All", 10),
    );
    target.store().set_fail_applies(true);

    let mut feed = FeedBuilder::new(R1)
        .matches("b", 1, "Memo", "b")
        .ending("SELECT @All", 20)
        .build();
    let err = target
        .run_pass(instance(R1), PassContext::default(), &mut feed)
        .unwrap_err();

    assert!(err.is_commit_failure());
    assert!(!target.is_pass_running());
    let mark = target.watermarks().get(&instance(R1)).unwrap().unwrap();
    assert_eq!(mark.last_end_timestamp, Timestamp::from_millis(10));

    // The retried pass replays the same range and succeeds.
    target.store().set_fail_applies(false);
    target
        .run_pass(instance(R1), PassContext::default(), &mut feed)
        .unwrap();
    assert_eq!(target.store().len(), 2);
}

#[test]
fn feed_sees_watermark_of_its_instance() {
    let target = memo_target();

    let mut first = FailingFeed::new(Vec::new(), 0);
    let _ = target.run_pass(instance(R1), PassContext::default(), &mut first);
    assert_eq!(first.seen_watermark(), Some(&None));

    commit_pass(&target, FeedBuilder::new(R1).ending("SELECT Form = \"Memo\"", 500));

    let mut second = FailingFeed::new(Vec::new(), 0);
    let _ = target.run_pass(instance(R1), PassContext::default(), &mut second);
    let seen = second.seen_watermark().unwrap().as_ref().unwrap();
    assert_eq!(seen.selection_formula, "SELECT Form = \"Memo\"");
    assert_eq!(seen.last_end_timestamp, Timestamp::from_millis(500));

    let mut other = FailingFeed::new(Vec::new(), 0);
    let _ = target.run_pass(instance("replica-2"), PassContext::default(), &mut other);
    assert_eq!(other.seen_watermark(), Some(&None));
}

#[test]
fn replicas_keep_independent_watermarks() {
    let target = memo_target();
    let mut a = RecordedFeed::new(Vec::new(), FeedEnd::new("fa", Timestamp::from_millis(1)));
    let mut b = RecordedFeed::new(Vec::new(), FeedEnd::new("fb", Timestamp::from_millis(2)));

    target
        .run_pass(instance("a"), PassContext::default(), &mut a)
        .unwrap();
    target
        .run_pass(instance("b"), PassContext::default(), &mut b)
        .unwrap();

    let marks = target.watermarks();
    assert_eq!(marks.get(&instance("a")).unwrap().unwrap().selection_formula, "fa");
    assert_eq!(marks.get(&instance("b")).unwrap().unwrap().selection_formula, "fb");
    assert_eq!(marks.last_instance_synced().unwrap(), Some(instance("b")));
}

#[test]
fn same_document_from_two_replicas() {
    let target = memo_target();
    commit_pass(&target, FeedBuilder::new("replica-a").matches("a", 3, "Memo", "from a"));

    // Replica b lags behind and replays an older version.
    let mut lagging = FeedBuilder::new("replica-b")
        .matches("a", 2, "Memo", "from b")
        .build();
    target
        .run_pass(instance("replica-b"), PassContext::default(), &mut lagging)
        .unwrap();

    assert_eq!(lagging.outcomes(), &[Outcome::None]);
    assert_eq!(target.store().get(&id("a")).unwrap().subject, "from a");
}

#[test]
fn context_filter_drops_unmapped_records() {
    let target = memo_target();
    commit_pass(&target, FeedBuilder::new(R1).matches("a", 1, "Memo", "memo"));

    let mut feed = FeedBuilder::new(R1)
        .matches("a", 2, "Reply", "now a reply")
        .matches("b", 1, "Reply", "reply")
        .matches("c", 1, "Memo", "memo")
        .build();
    target
        .run_pass(instance(R1), PassContext::only_form("Memo"), &mut feed)
        .unwrap();

    assert_eq!(
        feed.outcomes(),
        &[Outcome::Removed, Outcome::None, Outcome::Added]
    );
    let ids: Vec<_> = target
        .store()
        .snapshot()
        .into_iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, vec!["c"]);
}

#[test]
fn equal_sequence_tie_break_by_time() {
    let target = memo_target_with(
        SyncConfig::new("memos").with_tie_break(TieBreak::SequenceThenTime),
    );
    commit_pass(&target, FeedBuilder::new(R1).matches("a", 4, "Memo", "first"));

    let mut session = target.start(instance(R1), PassContext::default());
    let mut later = origin("a", 4, R1);
    later.sequence_time = Timestamp::from_millis(later.sequence_time.as_millis() + 1);
    let outcome = session
        .record_matches(&later, memo_payload("Memo", "second").as_bytes())
        .unwrap();
    assert_eq!(outcome, Outcome::Updated);
    session
        .commit("SELECT @All", &instance(R1), Timestamp::from_millis(5))
        .unwrap();

    assert_eq!(target.store().get(&id("a")).unwrap().subject, "second");
}

#[test]
fn stats_accumulate_across_passes() {
    let target = memo_target();
    commit_pass(
        &target,
        FeedBuilder::new(R1)
            .matches("a", 1, "Memo", "a")
            .matches("b", 1, "Memo", "b"),
    );
    commit_pass(
        &target,
        FeedBuilder::new(R1)
            .matches("a", 2, "Memo", "a2")
            .deleted("b", 1)
            .matches("a", 1, "Memo", "stale"),
    );

    let stats = target.stats();
    assert_eq!(stats.passes_committed, 2);
    assert_eq!(stats.records_added, 2);
    assert_eq!(stats.records_updated, 1);
    assert_eq!(stats.records_removed, 1);
    assert_eq!(stats.events_ignored, 1);
    assert!(stats.last_commit_time.is_some());
    assert!(stats.last_error.is_none());
}

/// A host store that relies on the default batch apply.
struct UpdateOnlyStore {
    inner: MemoryIndexStore<Memo>,
    reject_updates: AtomicBool,
}

impl IndexStore<Memo> for UpdateOnlyStore {
    fn lookup_by_unique_id(&self, id: &UniqueId) -> SyncResult<Option<Memo>> {
        self.inner.lookup_by_unique_id(id)
    }

    fn clear(&self) -> SyncResult<()> {
        self.inner.clear()
    }

    fn update(&self, to_remove: &[Memo], to_add: &[Memo]) -> SyncResult<()> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(SyncError::commit("rejected"));
        }
        self.inner.update(to_remove, to_add)
    }

    fn query(&self, predicate: &dyn Fn(&Memo) -> bool) -> SyncResult<Vec<Memo>> {
        self.inner.query(predicate)
    }
}

#[test]
fn rejected_wiped_commit_keeps_index_on_default_apply() {
    let target = SyncTarget::new(
        SyncConfig::new("memos"),
        UpdateOnlyStore {
            inner: MemoryIndexStore::new(),
            reject_updates: AtomicBool::new(false),
        },
        MemoryWatermarkStore::new(),
        map_memo,
    );
    let mut first = FeedBuilder::new(R1)
        .matches("a", 1, "Memo", "a")
        .matches("b", 1, "Memo", "b")
        .ending("f", 10)
        .build();
    target
        .run_pass(instance(R1), PassContext::default(), &mut first)
        .unwrap();

    target.store().reject_updates.store(true, Ordering::SeqCst);
    let mut session = target.start(instance(R1), PassContext::default());
    session.wipe();
    session
        .record_matches(&origin("c", 1, R1), memo_payload("Memo", "c").as_bytes())
        .unwrap();
    let err = session
        .commit("g", &instance(R1), Timestamp::from_millis(20))
        .unwrap_err();

    assert!(err.is_commit_failure());
    assert_eq!(target.store().inner.len(), 2);
    let mark = target.watermarks().get(&instance(R1)).unwrap().unwrap();
    assert_eq!(mark.selection_formula, "f");

    // Once the store accepts it, the same wipe replaces everything.
    target.store().reject_updates.store(false, Ordering::SeqCst);
    let mut retry = FeedBuilder::new(R1)
        .wipe()
        .matches("c", 1, "Memo", "c")
        .build();
    target
        .run_pass(instance(R1), PassContext::default(), &mut retry)
        .unwrap();
    let ids: Vec<_> = target
        .store()
        .inner
        .snapshot()
        .into_iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, vec!["c"]);
}
