//! Record fixtures and target helpers.
//!
//! The fixture record is a memo materialized from a small JSON payload.
//! The per-pass context can restrict a pass to one form, which exercises
//! payloads that do not yield a record.

use crate::store::InstrumentedStore;
use replidx_engine::{
    InstanceId, MemoryWatermarkStore, OriginatorRef, SyncConfig, SyncRecord, SyncTarget,
    Timestamp, UniqueId,
};
use serde::{Deserialize, Serialize};

/// A materialized memo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memo {
    /// Unique id of the source document.
    pub id: UniqueId,
    /// Version of the source document.
    pub sequence: u64,
    /// Modification time of that version.
    pub modified: Timestamp,
    /// Form the document was created with.
    pub form: String,
    /// Subject line.
    pub subject: String,
}

impl SyncRecord for Memo {
    fn unique_id(&self) -> &UniqueId {
        &self.id
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn sequence_time(&self) -> Timestamp {
        self.modified
    }
}

/// Raw payload of a memo as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoPayload {
    /// Form name.
    pub form: String,
    /// Subject line.
    pub subject: String,
}

/// Encodes a memo payload.
pub fn memo_payload(form: &str, subject: &str) -> String {
    serde_json::to_string(&MemoPayload {
        form: form.to_string(),
        subject: subject.to_string(),
    })
    .expect("memo payload serializes")
}

/// Per-pass context of the memo mapper.
#[derive(Debug, Clone, Default)]
pub struct PassContext {
    /// Only documents of this form are materialized.
    pub form: Option<String>,
}

impl PassContext {
    /// Restricts the pass to one form.
    pub fn only_form(form: impl Into<String>) -> Self {
        Self {
            form: Some(form.into()),
        }
    }
}

/// Maps a raw payload to a memo.
///
/// Unparseable payloads and payloads of a filtered-out form yield nothing.
pub fn map_memo(context: &PassContext, origin: &OriginatorRef, payload: &[u8]) -> Option<Memo> {
    let payload: MemoPayload = serde_json::from_slice(payload).ok()?;
    if context.form.as_ref().is_some_and(|form| *form != payload.form) {
        return None;
    }

    Some(Memo {
        id: origin.unique_id.clone(),
        sequence: origin.sequence,
        modified: origin.sequence_time,
        form: payload.form,
        subject: payload.subject,
    })
}

/// A sync target materializing memos into an instrumented in-memory index.
pub type MemoTarget = SyncTarget<Memo, PassContext, InstrumentedStore<Memo>, MemoryWatermarkStore>;

/// Creates a memo target with a default configuration.
pub fn memo_target() -> MemoTarget {
    memo_target_with(SyncConfig::new("memos"))
}

/// Creates a memo target with the given configuration.
pub fn memo_target_with(config: SyncConfig) -> MemoTarget {
    SyncTarget::new(
        config,
        InstrumentedStore::new(),
        MemoryWatermarkStore::new(),
        map_memo,
    )
}

/// Shorthand for an instance id.
pub fn instance(name: &str) -> InstanceId {
    InstanceId::new(name)
}

/// Builds an originator reference whose sequence time tracks its sequence.
pub fn origin(id: &str, sequence: u64, instance_name: &str) -> OriginatorRef {
    OriginatorRef::new(
        id,
        sequence,
        sequence_time_for(sequence),
        instance(instance_name),
    )
}

/// The sequence time fixtures use for a sequence number.
pub fn sequence_time_for(sequence: u64) -> Timestamp {
    Timestamp::from_millis(1_700_000_000_000 + sequence * 1_000)
}

/// Builds a memo with the given id and sequence.
pub fn memo(id: &str, sequence: u64) -> Memo {
    Memo {
        id: UniqueId::new(id),
        sequence,
        modified: sequence_time_for(sequence),
        form: "Memo".into(),
        subject: format!("{id} v{sequence}"),
    }
}
