//! Recorded change feeds.
//!
//! A [`RecordedFeed`] replays a change set captured ahead of time, for
//! example one exported by a source as JSON lines.

use crate::error::SyncResult;
use crate::session::{ChangeSink, FeedEnd, SourceFeed};
use crate::types::{OriginatorRef, Outcome, Timestamp};
use crate::watermark::Watermark;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use tracing::debug;

/// One entry of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    /// The record matches the selection criteria.
    Matches {
        /// The change.
        #[serde(flatten)]
        origin: OriginatorRef,
        /// Raw payload handed to the record mapper.
        payload: String,
    },
    /// The record no longer matches the selection criteria.
    NoLongerMatches {
        /// The change.
        #[serde(flatten)]
        origin: OriginatorRef,
    },
    /// The record was deleted at the source.
    Deleted {
        /// The change.
        #[serde(flatten)]
        origin: OriginatorRef,
    },
    /// The source asks for the index to be rebuilt from this pass alone.
    Wipe,
}

impl FeedEvent {
    /// The change this event reports, if any.
    pub fn origin(&self) -> Option<&OriginatorRef> {
        match self {
            FeedEvent::Matches { origin, .. }
            | FeedEvent::NoLongerMatches { origin }
            | FeedEvent::Deleted { origin } => Some(origin),
            FeedEvent::Wipe => None,
        }
    }

    /// Reports this event to a sink.
    pub fn report(&self, sink: &mut dyn ChangeSink) -> SyncResult<Outcome> {
        match self {
            FeedEvent::Matches { origin, payload } => {
                sink.record_matches(origin, payload.as_bytes())
            }
            FeedEvent::NoLongerMatches { origin } => sink.record_no_longer_matches(origin),
            FeedEvent::Deleted { origin } => sink.record_deleted(origin),
            FeedEvent::Wipe => {
                sink.wipe();
                Ok(Outcome::None)
            }
        }
    }
}

/// A source feed that replays a fixed list of events.
#[derive(Debug, Clone)]
pub struct RecordedFeed {
    events: Vec<FeedEvent>,
    end: FeedEnd,
    outcomes: Vec<Outcome>,
}

impl RecordedFeed {
    /// Creates a feed that reports `events` and then ends at `end`.
    pub fn new(events: Vec<FeedEvent>, end: FeedEnd) -> Self {
        Self {
            events,
            end,
            outcomes: Vec::new(),
        }
    }

    /// Reads one JSON-encoded event per line, skipping blank lines.
    ///
    /// # Errors
    ///
    /// Returns an error on the first line that cannot be read or parsed.
    pub fn from_json_lines(reader: impl BufRead, end: FeedEnd) -> SyncResult<Self> {
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(Self::new(events, end))
    }

    /// Events this feed reports.
    pub fn events(&self) -> &[FeedEvent] {
        &self.events
    }

    /// Outcomes of the last drive, one per event.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// The latest sequence time of any change in the feed.
    pub fn latest_sequence_time(&self) -> Option<Timestamp> {
        self.events
            .iter()
            .filter_map(FeedEvent::origin)
            .map(|origin| origin.sequence_time)
            .max()
    }
}

impl SourceFeed for RecordedFeed {
    fn drive(
        &mut self,
        sink: &mut dyn ChangeSink,
        watermark: Option<&Watermark>,
    ) -> SyncResult<FeedEnd> {
        debug!(
            instance = %sink.instance(),
            events = self.events.len(),
            incremental = watermark.is_some(),
            "replaying recorded feed"
        );

        self.outcomes.clear();
        for event in &self.events {
            let outcome = event.report(sink)?;
            self.outcomes.push(outcome);
        }
        Ok(self.end.clone())
    }
}
