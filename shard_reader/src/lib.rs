//! Ordered, restart-safe consumption of a dynamically partitioned event stream.
//!
//! A stream is made of shards that can split and merge over time. The [`Reader`] runs one
//! consumption task per active shard, holding back a child shard until every shard it was split
//! or merged from has been fully consumed, and relies on a [`CheckpointStore`] so that a restart
//! resumes where the previous process left off.
//!
//! # Components
//!
//! - [`ShardTopology`]: the in-memory view of every known shard, its lineage and its runtime
//!   state. Owned and mutated only by the [`Reader`].
//! - [`StreamSource`]: the stream service the reader lists shards and fetches records from.
//! - [`Processor`]: the application callback that receives record pages and checkpoints
//!   progress through a [`ShardHandle`].
//! - [`Reader`]: the dispatch loop. [`Reader::run`] blocks until [`Reader::stop`] is called or a
//!   fatal error occurs; delivery is at-least-once, bounded by checkpoint granularity.
//!
//! The design assumes a single active reader per stream and checkpoint store; there is no
//! cross-process leasing.

use thiserror::Error;

pub mod checkpoint;
mod consumer;
pub mod mock;
pub mod processor;
pub mod reader;
pub mod shard;
pub mod source;
pub mod topology;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, Checkpoints, FileCheckpointStore,
    MemoryCheckpointStore,
};
pub use processor::{Processor, ShardHandle};
pub use reader::{
    BootstrapPosition, DEFAULT_POLL_INTERVAL, Reader, ReaderArgs, ReaderOptions, StopHandle,
};
pub use shard::{
    InvalidSequenceNumber, SequenceNumber, SequenceNumberRange, ShardDescriptor, ShardId,
    ShardState,
};
pub use source::{
    IteratorPosition, Record, RecordPage, ShardIterator, ShardListPage, StreamSource, StreamStatus,
};
pub use topology::{ShardTopology, TopologyUpdate};

/// Boxed error type used at the pluggable boundaries of this crate.
///
/// The dynamic boxing makes it easier to deal with errors from different [`StreamSource`] and
/// [`Processor`] implementations.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that stop a [`Reader`].
///
/// Every variant is fatal to the whole reader: a single broken shard aborts consumption rather
/// than silently skipping a partition's data. Recovery is left to the host, typically by
/// creating a new reader, which resumes from the latest durable checkpoints.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load checkpoints: {0}")]
    LoadCheckpoints(#[source] CheckpointError),

    #[error("failed to refresh shard topology: {0}")]
    ListShards(#[source] DynError),

    #[error("stream is not active or updating (status: {status})")]
    StreamNotActive { status: StreamStatus },

    #[error("failed to get iterator for shard {shard_id}: {source}")]
    Iterator { shard_id: ShardId, source: DynError },

    #[error("failed to fetch records for shard {shard_id}: {source}")]
    Fetch { shard_id: ShardId, source: DynError },

    #[error("processor failed on shard {shard_id}: {source}")]
    Processor { shard_id: ShardId, source: DynError },

    #[error("failed to checkpoint shard {shard_id}: {source}")]
    Checkpoint {
        shard_id: ShardId,
        source: CheckpointError,
    },

    #[error("consumption task for shard {shard_id} panicked")]
    TaskPanicked { shard_id: ShardId },

    #[error("reader has already been started")]
    AlreadyStarted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
