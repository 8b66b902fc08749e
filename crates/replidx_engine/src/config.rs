//! Configuration for a synchronization target.

/// How two versions with the same sequence number are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// Sequence alone decides; an incoming version with the same sequence
    /// as the stored one is ignored.
    #[default]
    SequenceOnly,
    /// When sequences are equal, an incoming version with a strictly later
    /// sequence time replaces the stored one.
    SequenceThenTime,
}

/// Configuration for a [`SyncTarget`](crate::SyncTarget).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the target, used in logs.
    pub target_name: String,
    /// Ordering of versions with equal sequence numbers.
    pub tie_break: TieBreak,
    /// Whether the index already holds the result of a completed pass.
    ///
    /// While false, every inbound event is treated as an add and no
    /// lookups are issued.
    pub initial_sync_completed: bool,
}

impl SyncConfig {
    /// Creates a new configuration for the named target.
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            tie_break: TieBreak::default(),
            initial_sync_completed: false,
        }
    }

    /// Sets the tie-break policy.
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Marks the index as already populated by an earlier pass.
    ///
    /// Hosts that reopen a persisted index set this so the first pass of
    /// the process resolves conflicts instead of re-adding everything.
    pub fn with_initial_sync_completed(mut self, completed: bool) -> Self {
        self.initial_sync_completed = completed;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("default")
    }
}
