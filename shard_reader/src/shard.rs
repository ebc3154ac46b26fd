//! Shard identity, lineage and per-process runtime state.

use std::{cmp::Ordering, fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::checkpoint::Checkpoint;

/// Identifier of a shard within a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ShardId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A per-shard, monotonically increasing record position.
///
/// Stream services hand these out as decimal strings that can be far wider than any native
/// integer, so they are kept in their canonical decimal form (no leading zeros) and compared
/// numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        // canonical form: a longer string is a larger number
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A string that is not a valid [`SequenceNumber`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sequence number '{0}': expected a non-empty string of decimal digits")]
pub struct InvalidSequenceNumber(String);

impl FromStr for SequenceNumber {
    type Err = InvalidSequenceNumber;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidSequenceNumber(s.to_string()));
        }
        let trimmed = s.trim_start_matches('0');
        if trimmed.is_empty() {
            Ok(Self("0".to_string()))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for SequenceNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SequenceNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The range of sequence numbers a shard covers.
///
/// An `ending` bound is only present once the shard has been closed by a split or merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceNumberRange {
    pub starting: SequenceNumber,
    pub ending: Option<SequenceNumber>,
}

/// Description of a shard as reported by the stream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub parent_shard_id: Option<ShardId>,
    /// Only present on shards created by merging two adjacent shards.
    pub adjacent_parent_shard_id: Option<ShardId>,
    pub sequence_number_range: SequenceNumberRange,
}

impl ShardDescriptor {
    /// An open shard with no lineage starting at `starting`.
    pub fn open(shard_id: impl Into<ShardId>, starting: SequenceNumber) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
            adjacent_parent_shard_id: None,
            sequence_number_range: SequenceNumberRange {
                starting,
                ending: None,
            },
        }
    }

    pub fn with_parent(mut self, parent: impl Into<ShardId>) -> Self {
        self.parent_shard_id = Some(parent.into());
        self
    }

    pub fn with_adjacent_parent(mut self, adjacent_parent: impl Into<ShardId>) -> Self {
        self.adjacent_parent_shard_id = Some(adjacent_parent.into());
        self
    }

    /// Close the shard at `ending`.
    pub fn closed_at(mut self, ending: SequenceNumber) -> Self {
        self.sequence_number_range.ending = Some(ending);
        self
    }

    /// A closed shard is immutable: no more records will be appended to it.
    pub fn is_closed(&self) -> bool {
        self.sequence_number_range.ending.is_some()
    }

    pub fn ending_sequence_number(&self) -> Option<&SequenceNumber> {
        self.sequence_number_range.ending.as_ref()
    }
}

/// A [`ShardDescriptor`] together with the state this process keeps about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardState {
    pub(crate) descriptor: ShardDescriptor,
    /// A consumption task currently owns this shard.
    pub(crate) processing_active: bool,
    /// This process has iterated to the end of the shard, whether or not that has been
    /// checkpointed yet. Never reset once set.
    pub(crate) locally_finished: bool,
    /// Set during the very first topology build when no checkpoints exist anywhere: skip the
    /// shard's history and start at the tip.
    pub(crate) bootstrap_to_latest: bool,
    /// The topology refresh generation this shard was last reported in.
    pub(crate) seen_generation: u64,
}

impl ShardState {
    pub(crate) fn new(descriptor: ShardDescriptor, generation: u64) -> Self {
        Self {
            descriptor,
            processing_active: false,
            locally_finished: false,
            bootstrap_to_latest: false,
            seen_generation: generation,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.descriptor.shard_id
    }

    pub fn descriptor(&self) -> &ShardDescriptor {
        &self.descriptor
    }

    pub fn processing_active(&self) -> bool {
        self.processing_active
    }

    pub fn locally_finished(&self) -> bool {
        self.locally_finished
    }

    pub fn bootstrap_to_latest(&self) -> bool {
        self.bootstrap_to_latest
    }

    /// A shard is finished once it is closed and has either been consumed to its end by this
    /// process or has a checkpoint sitting exactly on its ending sequence number.
    pub fn is_finished(&self, checkpoint: Option<&Checkpoint>) -> bool {
        let Some(ending) = self.descriptor.ending_sequence_number() else {
            return false;
        };
        self.locally_finished || checkpoint.is_some_and(|c| &c.sequence_number == ending)
    }
}
