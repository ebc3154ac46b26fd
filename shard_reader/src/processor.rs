//! The application callback that receives records.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    DynError,
    checkpoint::{Checkpoint, CheckpointError, CheckpointStore},
    shard::{SequenceNumber, ShardId},
    source::Record,
};

/// Receives the records of every shard the reader consumes.
///
/// Records of one shard arrive strictly in stream order, one page at a time; pages of different
/// shards may be delivered concurrently. The processor decides how often to call
/// [`ShardHandle::checkpoint`]; everything after the last checkpoint is redelivered after a
/// restart.
///
/// Returning an error stops the whole reader. An error produced by
/// [`ShardHandle::checkpoint`] and returned unchanged (e.g. with `?`) is reported as a checkpoint
/// failure.
#[async_trait]
pub trait Processor: Debug + Send + Sync + 'static {
    async fn process_records(&self, shard: &ShardHandle, records: Vec<Record>)
    -> Result<(), DynError>;
}

/// A processor's view of the shard whose records it is handling.
#[derive(Debug)]
pub struct ShardHandle {
    shard_id: ShardId,
    checkpoint_store: Arc<dyn CheckpointStore>,
    last_checkpoint: Mutex<Option<SequenceNumber>>,
}

impl ShardHandle {
    pub(crate) fn new(
        shard_id: ShardId,
        checkpoint_store: Arc<dyn CheckpointStore>,
        last_checkpoint: Option<SequenceNumber>,
    ) -> Self {
        Self {
            shard_id,
            checkpoint_store,
            last_checkpoint: Mutex::new(last_checkpoint),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// The last sequence number checkpointed for this shard, if any.
    pub async fn last_checkpoint(&self) -> Option<SequenceNumber> {
        self.last_checkpoint.lock().await.clone()
    }

    /// Record that every record of this shard up to and including `sequence_number` has been
    /// processed.
    ///
    /// Checkpoints never move backwards: a sequence number lower than the last one written is
    /// rejected with [`CheckpointError::Regression`]. Writing the same one again is a no-op
    /// for ordering purposes but is still passed to the store.
    pub async fn checkpoint(&self, sequence_number: SequenceNumber) -> Result<(), CheckpointError> {
        let mut last = self.last_checkpoint.lock().await;
        if let Some(current) = last.as_ref() {
            if &sequence_number < current {
                return Err(CheckpointError::Regression {
                    shard_id: self.shard_id.clone(),
                    current: current.clone(),
                    attempted: sequence_number,
                });
            }
        }

        self.checkpoint_store
            .set_checkpoint(Checkpoint::new(
                self.shard_id.clone(),
                Utc::now(),
                sequence_number.clone(),
            ))
            .await?;

        debug!(shard_id = %self.shard_id, %sequence_number, "checkpointed shard");
        *last = Some(sequence_number);
        Ok(())
    }
}
