//! Conflict resolution between inbound changes and materialized state.
//!
//! Sequence is the authoritative version of a record. For every inbound
//! event the resolver compares the incoming sequence with, in order:
//! 1. A pending add staged earlier in the same pass
//! 2. The record committed in the index (skipped before the first
//!    successful commit and after a wipe request)
//!
//! A newer version replaces the older one; the same or an older version is
//! ignored, which makes replays from any replica harmless. Removal events
//! remove unconditionally.

use crate::config::TieBreak;
use crate::error::SyncResult;
use crate::staging::StagingBuffer;
use crate::store::IndexStore;
use crate::types::{OriginatorRef, Outcome, SyncRecord, Timestamp, UniqueId};

/// The decision for one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<R> {
    /// No record exists for the id; stage the new one.
    Add(R),
    /// A committed record is superseded. Stage its removal and, if the
    /// payload produced one, the new record.
    Replace {
        /// Record currently committed in the index.
        existing: R,
        /// Record produced from the payload.
        incoming: Option<R>,
    },
    /// A pending add of this pass is superseded by a newer version.
    ReplacePending(R),
    /// Removal event for a record that is committed, pending, or both.
    Remove {
        /// Committed record to stage for removal.
        committed: Option<R>,
        /// Whether a pending add for the id must be dropped.
        cancel_pending: bool,
    },
    /// The incoming version is not newer than the one already held.
    Stale {
        /// Sequence of the pending or committed version that is kept.
        current_sequence: u64,
    },
    /// Nothing to do.
    Ignore,
}

impl<R> Resolution<R> {
    /// The outcome reported to the source feed for this decision.
    pub fn outcome(&self) -> Outcome {
        match self {
            Resolution::Add(_) => Outcome::Added,
            Resolution::Replace {
                incoming: Some(_), ..
            } => Outcome::Updated,
            Resolution::Replace { incoming: None, .. } => Outcome::Removed,
            Resolution::ReplacePending(_) => Outcome::Updated,
            Resolution::Remove { .. } => Outcome::Removed,
            Resolution::Stale { .. } | Resolution::Ignore => Outcome::None,
        }
    }

    /// Stages this decision for the record with the given id.
    pub fn stage(self, staging: &mut StagingBuffer<R>, id: &UniqueId)
    where
        R: SyncRecord,
    {
        match self {
            Resolution::Add(record) | Resolution::ReplacePending(record) => {
                staging.stage_add(record);
            }
            Resolution::Replace { existing, incoming } => {
                staging.stage_remove(existing);
                if let Some(record) = incoming {
                    staging.stage_add(record);
                }
            }
            Resolution::Remove {
                committed,
                cancel_pending,
            } => {
                if cancel_pending {
                    staging.cancel_add(id);
                }
                if let Some(record) = committed {
                    staging.stage_remove(record);
                }
            }
            Resolution::Stale { .. } | Resolution::Ignore => {}
        }
    }
}

/// Decides how inbound change events affect the staged state of a pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    tie_break: TieBreak,
}

impl ConflictResolver {
    /// Creates a resolver with the given tie-break policy.
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Returns the tie-break policy.
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Returns true if the incoming version supersedes the current one.
    pub fn supersedes(
        &self,
        current_sequence: u64,
        current_time: Timestamp,
        incoming: &OriginatorRef,
    ) -> bool {
        use std::cmp::Ordering;

        match incoming.sequence.cmp(&current_sequence) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                self.tie_break == TieBreak::SequenceThenTime
                    && incoming.sequence_time > current_time
            }
        }
    }

    /// Resolves a "matches" event.
    ///
    /// `lookups_enabled` is false before the first successful commit and
    /// after a wipe request; the index is not consulted then. `map` turns
    /// the payload into a record and is only called when the event is not
    /// ignored.
    pub fn resolve_matches<R, S>(
        &self,
        store: &S,
        staging: &StagingBuffer<R>,
        lookups_enabled: bool,
        origin: &OriginatorRef,
        map: impl FnOnce() -> Option<R>,
    ) -> SyncResult<Resolution<R>>
    where
        R: SyncRecord,
        S: IndexStore<R> + ?Sized,
    {
        if let Some(pending) = staging.pending_add(&origin.unique_id) {
            if !self.supersedes(pending.sequence(), pending.sequence_time(), origin) {
                return Ok(Resolution::Stale {
                    current_sequence: pending.sequence(),
                });
            }
            return Ok(match map() {
                Some(record) => Resolution::ReplacePending(record),
                None => Resolution::Remove {
                    committed: None,
                    cancel_pending: true,
                },
            });
        }

        let existing = if lookups_enabled {
            store.lookup_by_unique_id(&origin.unique_id)?
        } else {
            None
        };

        Ok(match existing {
            None => match map() {
                Some(record) => Resolution::Add(record),
                None => Resolution::Ignore,
            },
            Some(existing)
                if self.supersedes(existing.sequence(), existing.sequence_time(), origin) =>
            {
                Resolution::Replace {
                    existing,
                    incoming: map(),
                }
            }
            Some(existing) => Resolution::Stale {
                current_sequence: existing.sequence(),
            },
        })
    }

    /// Resolves a "no longer matches" or "deleted" event.
    ///
    /// Removal ignores sequence: whatever is committed or pending for the
    /// id is removed.
    pub fn resolve_removal<R, S>(
        &self,
        store: &S,
        staging: &StagingBuffer<R>,
        lookups_enabled: bool,
        origin: &OriginatorRef,
    ) -> SyncResult<Resolution<R>>
    where
        R: SyncRecord,
        S: IndexStore<R> + ?Sized,
    {
        let cancel_pending = staging.pending_add(&origin.unique_id).is_some();
        let committed = if lookups_enabled {
            store.lookup_by_unique_id(&origin.unique_id)?
        } else {
            None
        };

        if committed.is_none() && !cancel_pending {
            return Ok(Resolution::Ignore);
        }
        Ok(Resolution::Remove {
            committed,
            cancel_pending,
        })
    }
}
