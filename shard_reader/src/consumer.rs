//! Consumption of a single shard, from its start position to its end or until stopped.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    DynError, Error, Result,
    checkpoint::{Checkpoint, CheckpointError, CheckpointStore},
    processor::{Processor, ShardHandle},
    shard::ShardId,
    source::{IteratorPosition, StreamSource},
};

/// How a shard's consumption task ended, as reported back to the reader.
#[derive(Debug)]
pub(crate) enum ShardOutcome {
    /// The shard is closed and every record in it has been handed to the processor.
    Finished,
    /// The reader asked the task to stop before the shard was exhausted.
    Stopped,
    Failed(Error),
}

#[derive(Debug)]
pub(crate) struct ShardStatus {
    pub(crate) shard_id: ShardId,
    pub(crate) outcome: ShardOutcome,
}

/// Where a shard without an active task should start reading.
///
/// A checkpoint always wins; without one, a shard flagged during bootstrap starts at the tip
/// and every other shard is replayed from the oldest retained record.
pub(crate) fn start_position(
    checkpoint: Option<&Checkpoint>,
    bootstrap_to_latest: bool,
) -> IteratorPosition {
    match checkpoint {
        Some(checkpoint) => {
            IteratorPosition::AfterSequenceNumber(checkpoint.sequence_number.clone())
        }
        None if bootstrap_to_latest => IteratorPosition::Latest,
        None => IteratorPosition::TrimHorizon,
    }
}

/// Reads one shard strictly in order and hands every non-empty page to the [`Processor`].
#[derive(Debug)]
pub(crate) struct ShardConsumer {
    shard_id: ShardId,
    start: IteratorPosition,
    source: Arc<dyn StreamSource>,
    processor: Arc<dyn Processor>,
    handle: ShardHandle,
    poll_interval: Duration,
}

impl ShardConsumer {
    pub(crate) fn new(
        shard_id: ShardId,
        checkpoint: Option<&Checkpoint>,
        bootstrap_to_latest: bool,
        source: Arc<dyn StreamSource>,
        processor: Arc<dyn Processor>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        poll_interval: Duration,
    ) -> Self {
        let start = start_position(checkpoint, bootstrap_to_latest);
        let handle = ShardHandle::new(
            shard_id.clone(),
            checkpoint_store,
            checkpoint.map(|c| c.sequence_number.clone()),
        );
        Self {
            shard_id,
            start,
            source,
            processor,
            handle,
            poll_interval,
        }
    }

    /// Consume the shard until it is exhausted, `shutdown` is cancelled or an error occurs.
    ///
    /// Cancellation is only observed between polls; an in-flight fetch or processor call is
    /// always allowed to complete.
    pub(crate) async fn run(self, shutdown: CancellationToken) -> ShardOutcome {
        match self.consume(&shutdown).await {
            Ok(outcome) => outcome,
            Err(e) => ShardOutcome::Failed(e),
        }
    }

    async fn consume(&self, shutdown: &CancellationToken) -> Result<ShardOutcome> {
        info!(shard_id = %self.shard_id, start = ?self.start, "starting shard consumption");

        let mut iterator = Some(
            self.source
                .shard_iterator(&self.shard_id, &self.start)
                .await
                .map_err(|source| Error::Iterator {
                    shard_id: self.shard_id.clone(),
                    source,
                })?,
        );

        loop {
            let Some(current) = iterator.take() else {
                info!(shard_id = %self.shard_id, "reached end of shard");
                return Ok(ShardOutcome::Finished);
            };

            let page = self
                .source
                .records(&current)
                .await
                .map_err(|source| Error::Fetch {
                    shard_id: self.shard_id.clone(),
                    source,
                })?;

            debug!(
                shard_id = %self.shard_id,
                n_records = page.records.len(),
                millis_behind_latest = page.millis_behind_latest,
                "fetched records"
            );

            if !page.records.is_empty() {
                self.processor
                    .process_records(&self.handle, page.records)
                    .await
                    .map_err(|e| processor_error(&self.shard_id, e))?;
            }

            iterator = page.next_iterator;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(shard_id = %self.shard_id, "shard consumption stopped");
                    return Ok(ShardOutcome::Stopped);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// A checkpoint failure bubbled up unchanged through the processor is reported as such.
fn processor_error(shard_id: &ShardId, error: DynError) -> Error {
    match error.downcast::<CheckpointError>() {
        Ok(source) => Error::Checkpoint {
            shard_id: shard_id.clone(),
            source: *source,
        },
        Err(source) => Error::Processor {
            shard_id: shard_id.clone(),
            source,
        },
    }
}
