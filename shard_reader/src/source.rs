//! The stream service a [`Reader`](crate::Reader) consumes.

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{
    DynError,
    shard::{SequenceNumber, ShardDescriptor, ShardId},
};

/// Lifecycle status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Creating,
    Active,
    Updating,
    Deleting,
}

impl StreamStatus {
    /// Shards can only be listed and read while the stream is active or being resharded.
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Active | Self::Updating)
    }
}

impl Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Active => "ACTIVE",
            Self::Updating => "UPDATING",
            Self::Deleting => "DELETING",
        };
        f.write_str(s)
    }
}

/// One page of a shard listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardListPage {
    pub status: StreamStatus,
    pub shards: Vec<ShardDescriptor>,
    /// More shards follow the last one in `shards`.
    pub has_more_shards: bool,
}

/// Where a new [`ShardIterator`] starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// Just past the most recent record: only records written from now on.
    Latest,
    /// The oldest record still retained by the stream.
    TrimHorizon,
    /// The record immediately after the given sequence number.
    AfterSequenceNumber(SequenceNumber),
}

/// An opaque, short-lived read position within a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardIterator(String);

impl ShardIterator {
    pub fn new(iterator: impl Into<String>) -> Self {
        Self(iterator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub data: Bytes,
    pub approximate_arrival: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(
        sequence_number: SequenceNumber,
        partition_key: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            sequence_number,
            partition_key: partition_key.into(),
            data: data.into(),
            approximate_arrival: None,
        }
    }
}

/// The result of a single record fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPage {
    pub records: Vec<Record>,
    /// Where to continue reading. `None` once a closed shard has been read to its end.
    pub next_iterator: Option<ShardIterator>,
    /// How far the returned records are behind the tip of the stream.
    pub millis_behind_latest: u64,
}

/// Read access to a sharded stream.
///
/// Implementations are expected to perform whatever retry and backoff their transport offers;
/// the reader itself treats every error returned here as fatal.
#[async_trait]
pub trait StreamSource: Debug + Send + Sync + 'static {
    /// List the stream's shards, starting after `exclusive_start_shard_id` when given.
    async fn list_shards(
        &self,
        exclusive_start_shard_id: Option<&ShardId>,
    ) -> Result<ShardListPage, DynError>;

    /// Obtain an iterator reading `shard_id` from `position`.
    async fn shard_iterator(
        &self,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ShardIterator, DynError>;

    /// Fetch the next page of records at `iterator`.
    async fn records(&self, iterator: &ShardIterator) -> Result<RecordPage, DynError>;
}
