//! Change-feed builders.

use crate::fixtures::{memo_payload, origin};
use replidx_engine::{
    ChangeSink, FeedEnd, FeedEvent, RecordedFeed, SourceFeed, SyncError, SyncResult, Timestamp,
    Watermark,
};

/// Builds recorded feeds for one instance.
#[derive(Debug, Clone)]
pub struct FeedBuilder {
    instance: String,
    events: Vec<FeedEvent>,
    end: FeedEnd,
}

impl FeedBuilder {
    /// Starts a feed for the named instance.
    pub fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            events: Vec::new(),
            end: FeedEnd::new("SELECT @All", Timestamp::from_millis(1)),
        }
    }

    /// Adds a "matches" event with a memo payload.
    pub fn matches(self, id: &str, sequence: u64, form: &str, subject: &str) -> Self {
        let payload = memo_payload(form, subject);
        self.matches_raw(id, sequence, &payload)
    }

    /// Adds a "matches" event with an arbitrary payload.
    pub fn matches_raw(mut self, id: &str, sequence: u64, payload: &str) -> Self {
        self.events.push(FeedEvent::Matches {
            origin: origin(id, sequence, &self.instance),
            payload: payload.to_string(),
        });
        self
    }

    /// Adds a "no longer matches" event.
    pub fn no_longer_matches(mut self, id: &str, sequence: u64) -> Self {
        self.events.push(FeedEvent::NoLongerMatches {
            origin: origin(id, sequence, &self.instance),
        });
        self
    }

    /// Adds a "deleted" event.
    pub fn deleted(mut self, id: &str, sequence: u64) -> Self {
        self.events.push(FeedEvent::Deleted {
            origin: origin(id, sequence, &self.instance),
        });
        self
    }

    /// Adds a wipe request.
    pub fn wipe(mut self) -> Self {
        self.events.push(FeedEvent::Wipe);
        self
    }

    /// Sets where the next pass resumes.
    pub fn ending(mut self, selection_formula: &str, next_start: u64) -> Self {
        self.end = FeedEnd::new(selection_formula, Timestamp::from_millis(next_start));
        self
    }

    /// The events added so far.
    pub fn events(&self) -> &[FeedEvent] {
        &self.events
    }

    /// Builds the feed.
    pub fn build(self) -> RecordedFeed {
        RecordedFeed::new(self.events, self.end)
    }
}

/// A feed that reports some events and then fails.
#[derive(Debug, Clone)]
pub struct FailingFeed {
    events: Vec<FeedEvent>,
    fail_after: usize,
    seen_watermark: Option<Option<Watermark>>,
}

impl FailingFeed {
    /// Reports the first `fail_after` events, then fails.
    pub fn new(events: Vec<FeedEvent>, fail_after: usize) -> Self {
        Self {
            events,
            fail_after,
            seen_watermark: None,
        }
    }

    /// The watermark the feed was driven with, if it was driven.
    pub fn seen_watermark(&self) -> Option<&Option<Watermark>> {
        self.seen_watermark.as_ref()
    }
}

impl SourceFeed for FailingFeed {
    fn drive(
        &mut self,
        sink: &mut dyn ChangeSink,
        watermark: Option<&Watermark>,
    ) -> SyncResult<FeedEnd> {
        self.seen_watermark = Some(watermark.cloned());
        for event in self.events.iter().take(self.fail_after) {
            event.report(sink)?;
        }
        Err(SyncError::feed("connection to source lost"))
    }
}
