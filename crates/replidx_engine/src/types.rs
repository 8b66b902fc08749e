//! Core types shared by every part of the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, globally unique identifier of a logical source entity.
///
/// The same id is reported by every replica that holds a copy of the
/// entity, so it is the key of the materialized index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(String);

impl UniqueId {
    /// Creates a unique id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UniqueId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UniqueId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of one source instance (replica).
///
/// Each instance has its own independent watermark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Creates an instance id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Milliseconds since the Unix epoch.
///
/// Used both for watermark end times and for the per-record sequence time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds since the Unix epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the Unix epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        use std::time::SystemTime;
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A record held by the materialized index.
pub trait SyncRecord: Clone + Send + Sync + 'static {
    /// The stable identifier of the entity this record materializes.
    fn unique_id(&self) -> &UniqueId;

    /// Monotonically increasing version of the entity.
    fn sequence(&self) -> u64;

    /// Clock value accompanying the sequence.
    fn sequence_time(&self) -> Timestamp;
}

/// Describes one inbound change reported by the source feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginatorRef {
    /// Entity the change is about.
    pub unique_id: UniqueId,
    /// Version of the entity carried by the change.
    pub sequence: u64,
    /// Clock value of that version.
    pub sequence_time: Timestamp,
    /// Replica that reported the change.
    pub source_instance_id: InstanceId,
}

impl OriginatorRef {
    /// Creates an originator reference.
    pub fn new(
        unique_id: impl Into<UniqueId>,
        sequence: u64,
        sequence_time: Timestamp,
        source_instance_id: InstanceId,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            sequence,
            sequence_time,
            source_instance_id,
        }
    }
}

/// What a single inbound event did to the staged state of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// A new record was staged for insertion.
    Added,
    /// An existing record was staged for replacement by a newer one.
    Updated,
    /// An existing record was staged for removal.
    Removed,
    /// Nothing was staged.
    None,
}

impl Outcome {
    /// Returns true if the event staged any change.
    pub fn is_change(&self) -> bool {
        !matches!(self, Outcome::None)
    }
}
