//! # replidx Engine
//!
//! Incremental reconciliation engine that keeps a local, queryable
//! materialized index consistent with a remote change feed.
//!
//! This crate provides:
//! - Pass lifecycle (idle → running → idle via commit or abort)
//! - Sequence-based conflict resolution per unique id
//! - Staged, atomic apply of each pass
//! - Per-source-instance watermark tracking
//! - Mutual exclusion of passes against one target
//! - Replay of recorded change feeds
//!
//! ## Architecture
//!
//! A host drives one pass at a time per [`SyncTarget`]:
//! 1. [`SyncTarget::start`] acquires the target's exclusivity lock
//! 2. The change feed reports each record as "matches", "no longer
//!    matches" or "deleted"; the session stages the resolved changes
//! 3. [`SyncSession::commit`] applies all staged removes and adds to the
//!    [`IndexStore`] in one call and advances the [`WatermarkStore`];
//!    [`SyncSession::abort`] discards everything
//!
//! ## Key Invariants
//!
//! - The index holds at most one record per unique id, always the one
//!   with the highest committed sequence
//! - The index is mutated only at commit, under the lock
//! - An aborted pass leaves the index and watermarks untouched
//! - Watermarks advance only on a successful commit
//!
//! ## Example
//!
//! ```rust
//! use replidx_engine::{
//!     InstanceId, MemoryIndexStore, MemoryWatermarkStore, OriginatorRef, Outcome, SyncConfig,
//!     SyncRecord, SyncTarget, Timestamp, UniqueId,
//! };
//!
//! #[derive(Debug, Clone)]
//! struct Note {
//!     id: UniqueId,
//!     sequence: u64,
//!     modified: Timestamp,
//!     text: String,
//! }
//!
//! impl SyncRecord for Note {
//!     fn unique_id(&self) -> &UniqueId {
//!         &self.id
//!     }
//!     fn sequence(&self) -> u64 {
//!         self.sequence
//!     }
//!     fn sequence_time(&self) -> Timestamp {
//!         self.modified
//!     }
//! }
//!
//! let target = SyncTarget::new(
//!     SyncConfig::new("notes"),
//!     MemoryIndexStore::new(),
//!     MemoryWatermarkStore::new(),
//!     |_ctx: &(), origin: &OriginatorRef, payload: &[u8]| {
//!         Some(Note {
//!             id: origin.unique_id.clone(),
//!             sequence: origin.sequence,
//!             modified: origin.sequence_time,
//!             text: String::from_utf8(payload.to_vec()).ok()?,
//!         })
//!     },
//! );
//!
//! let replica = InstanceId::new("replica-a");
//! let mut session = target.start(replica.clone(), ());
//! let origin = OriginatorRef::new("n-1", 1, Timestamp::from_millis(10), replica.clone());
//! assert_eq!(session.record_matches(&origin, b"hello").unwrap(), Outcome::Added);
//! session.commit("Form = \"Note\"", &replica, Timestamp::from_millis(20)).unwrap();
//!
//! assert_eq!(target.store().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod feed;
mod lock;
mod resolver;
mod session;
mod staging;
mod store;
mod types;
mod watermark;

pub use config::{SyncConfig, TieBreak};
pub use error::{SyncError, SyncResult};
pub use feed::{FeedEvent, RecordedFeed};
pub use lock::{ExclusivityLock, LockToken};
pub use resolver::{ConflictResolver, Resolution};
pub use session::{
    ChangeSink, FeedEnd, PassSummary, RecordMapper, SourceFeed, SyncSession, SyncStats,
    SyncTarget,
};
pub use staging::StagingBuffer;
pub use store::{IndexStore, MemoryIndexStore};
pub use types::{InstanceId, OriginatorRef, Outcome, SyncRecord, Timestamp, UniqueId};
pub use watermark::{
    FileWatermarkStore, MemoryWatermarkStore, Watermark, WatermarkStore, WatermarkTable,
};
