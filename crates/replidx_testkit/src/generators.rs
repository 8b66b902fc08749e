//! Property-based test generators using proptest.
//!
//! Ids are drawn from a small pool so that generated feeds touch the same
//! records repeatedly.

use crate::fixtures::{memo_payload, sequence_time_for};
use proptest::prelude::*;
use replidx_engine::{FeedEvent, InstanceId, OriginatorRef, UniqueId};

/// Size of the id pool.
pub const ID_POOL: u8 = 6;

/// Strategy for unique ids from the shared pool.
pub fn unique_id_strategy() -> impl Strategy<Value = UniqueId> {
    (0..ID_POOL).prop_map(|n| UniqueId::new(format!("doc-{n}")))
}

/// Strategy for changes reported by one of two replicas.
pub fn origin_strategy() -> impl Strategy<Value = OriginatorRef> {
    (unique_id_strategy(), 1u64..20, prop::bool::ANY).prop_map(|(id, sequence, second)| {
        let replica = if second { "replica-b" } else { "replica-a" };
        OriginatorRef::new(id, sequence, sequence_time_for(sequence), InstanceId::new(replica))
    })
}

/// Strategy for "matches" events whose payload always maps to a memo.
pub fn matches_event_strategy() -> impl Strategy<Value = FeedEvent> {
    (origin_strategy(), "[a-z ]{0,12}").prop_map(|(origin, subject)| FeedEvent::Matches {
        origin,
        payload: memo_payload("Memo", &subject),
    })
}

/// Strategy for any feed event, weighted towards "matches".
pub fn feed_event_strategy() -> impl Strategy<Value = FeedEvent> {
    prop_oneof![
        6 => matches_event_strategy(),
        2 => origin_strategy().prop_map(|origin| FeedEvent::NoLongerMatches { origin }),
        2 => origin_strategy().prop_map(|origin| FeedEvent::Deleted { origin }),
        1 => Just(FeedEvent::Wipe),
    ]
}

/// Strategy for a feed of up to `max_len` arbitrary events.
pub fn feed_events_strategy(max_len: usize) -> impl Strategy<Value = Vec<FeedEvent>> {
    prop::collection::vec(feed_event_strategy(), 0..=max_len)
}

/// Strategy for a feed of up to `max_len` "matches" events.
pub fn matches_feed_strategy(max_len: usize) -> impl Strategy<Value = Vec<FeedEvent>> {
    prop::collection::vec(matches_event_strategy(), 0..=max_len)
}
