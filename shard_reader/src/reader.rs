//! The dispatch loop that starts and reaps one consumption task per shard.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::{
    Error, Result,
    checkpoint::{Checkpoint, CheckpointStore, Checkpoints},
    consumer::{ShardConsumer, ShardOutcome, ShardStatus},
    processor::Processor,
    shard::{ShardDescriptor, ShardId},
    source::StreamSource,
    topology::ShardTopology,
};

/// Default wait between two record fetches of the same shard.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where to start reading shards that have no checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BootstrapPosition {
    /// On the very first run against a stream (no checkpoints at all), skip the existing
    /// history and only consume records written from now on.
    #[default]
    Latest,
    /// Replay every shard from the oldest retained record.
    Oldest,
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub bootstrap_position: BootstrapPosition,
    pub poll_interval: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            bootstrap_position: BootstrapPosition::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub struct ReaderArgs {
    pub source: Arc<dyn StreamSource>,
    pub processor: Arc<dyn Processor>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub options: ReaderOptions,
    /// Span the reader and all its shard tasks log under. Defaults to a `shard_reader` span.
    pub span: Option<Span>,
}

/// Stops a [`Reader`] from anywhere, any number of times.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shutdown: CancellationToken,
}

impl StopHandle {
    /// Ask the reader and all its shard tasks to stop. Does not wait for them to do so; that
    /// happens before [`Reader::run`] returns.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("stopping shard reader");
        }
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Consumes every shard of a stream, one task per shard, in lineage order.
///
/// A child shard is only started once all of its parents are finished, so records of a key
/// are delivered in the order they were written across splits and merges. Unrelated shards
/// are consumed in parallel.
#[derive(Debug)]
pub struct Reader {
    source: Arc<dyn StreamSource>,
    processor: Arc<dyn Processor>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    options: ReaderOptions,
    span: Span,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl Reader {
    pub fn new(
        ReaderArgs {
            source,
            processor,
            checkpoint_store,
            options,
            span,
        }: ReaderArgs,
    ) -> Self {
        Self {
            source,
            processor,
            checkpoint_store,
            options,
            span: span.unwrap_or_else(|| info_span!("shard_reader")),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// See [`StopHandle::stop`].
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Consume the stream until [`stop`](Self::stop) is called or an error occurs.
    ///
    /// Returns `Ok(())` after a requested stop and the first fatal error otherwise. Either
    /// way, every shard task has been signalled and has finished before this returns.
    ///
    /// A reader can only be run once.
    pub async fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let span = self.span.clone();
        async move {
            info!(
                bootstrap_position = ?self.options.bootstrap_position,
                poll_interval = ?self.options.poll_interval,
                "starting shard reader"
            );

            let checkpoints = self
                .checkpoint_store
                .all_checkpoints()
                .await
                .map_err(Error::LoadCheckpoints)?;
            debug!(n_checkpoints = checkpoints.len(), "loaded checkpoints");

            let mut dispatcher = Dispatcher::new(self, checkpoints);
            let result = dispatcher.dispatch().await;
            dispatcher.shutdown().await;

            match &result {
                Ok(()) => info!("shard reader stopped"),
                Err(error) => error!(%error, "shard reader failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// State of a single [`Reader::run`].
#[derive(Debug)]
struct Dispatcher<'a> {
    reader: &'a Reader,
    topology: ShardTopology,
    /// Snapshot loaded on startup, plus the end-of-shard checkpoints made up during bootstrap.
    checkpoints: Checkpoints,
    /// Shard tasks that have not reported their outcome yet.
    active: usize,
    tasks: TaskTracker,
    status_tx: mpsc::UnboundedSender<ShardStatus>,
    status_rx: mpsc::UnboundedReceiver<ShardStatus>,
}

impl<'a> Dispatcher<'a> {
    fn new(reader: &'a Reader, checkpoints: Checkpoints) -> Self {
        // unbounded: a burst of shard completions must never block a task on reporting
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Self {
            reader,
            topology: ShardTopology::new(),
            checkpoints,
            active: 0,
            tasks: TaskTracker::new(),
            status_tx,
            status_rx,
        }
    }

    async fn dispatch(&mut self) -> Result<()> {
        let mut bootstrap = self.checkpoints.is_empty()
            && self.reader.options.bootstrap_position == BootstrapPosition::Latest;

        loop {
            if self.reader.shutdown.is_cancelled() {
                return Ok(());
            }

            let shards = self.refresh().await?;
            let delta = self.topology.update(shards);
            if !delta.is_empty() {
                info!(
                    added = ?delta.added,
                    removed = ?delta.removed,
                    n_shards = self.topology.len(),
                    "shard topology changed"
                );
            }

            if bootstrap {
                self.bootstrap_to_latest();
                bootstrap = false;
            }

            // a stop that arrived during the refresh must not start new tasks
            if self.reader.shutdown.is_cancelled() {
                return Ok(());
            }
            self.start_eligible();

            let status = tokio::select! {
                biased;
                _ = self.reader.shutdown.cancelled() => None,
                status = self.status_rx.recv() => status,
            };
            let Some(status) = status else {
                return Ok(());
            };
            self.handle_status(status)?;
        }
    }

    /// List every shard of the stream, following pagination to the end.
    async fn refresh(&self) -> Result<Vec<ShardDescriptor>> {
        let mut shards = vec![];
        let mut exclusive_start: Option<ShardId> = None;

        loop {
            let page = self
                .reader
                .source
                .list_shards(exclusive_start.as_ref())
                .await
                .map_err(Error::ListShards)?;
            if !page.status.is_readable() {
                return Err(Error::StreamNotActive {
                    status: page.status,
                });
            }

            if !page.has_more_shards {
                shards.extend(page.shards);
                break;
            }
            // a partial listing would prune shards that still exist
            let Some(last) = page.shards.last() else {
                return Err(Error::ListShards(
                    "shard listing reported more shards but returned an empty page".into(),
                ));
            };
            exclusive_start = Some(last.shard_id.clone());
            shards.extend(page.shards);
        }

        debug!(n_shards = shards.len(), "listed shards");
        Ok(shards)
    }

    /// First run against a stream: start open shards at the tip and treat closed shards as
    /// already consumed, so history written before the reader existed is skipped.
    fn bootstrap_to_latest(&mut self) {
        let shards: Vec<_> = self
            .topology
            .iter()
            .map(|s| {
                (
                    s.shard_id().clone(),
                    s.descriptor().ending_sequence_number().cloned(),
                )
            })
            .collect();

        let now = Utc::now();
        for (shard_id, ending) in shards {
            match ending {
                Some(ending) => {
                    debug!(%shard_id, %ending, "skipping closed shard on bootstrap");
                    self.checkpoints
                        .insert(shard_id.clone(), Checkpoint::new(shard_id, now, ending));
                }
                None => {
                    info!(%shard_id, "bootstrapping open shard at latest");
                    self.topology.mark_bootstrap_to_latest(&shard_id);
                }
            }
        }
    }

    /// Start a task for every inactive, unfinished shard whose parents are finished.
    fn start_eligible(&mut self) {
        for shard_id in self.topology.eligible_shards(&self.checkpoints) {
            let Some(state) = self.topology.get(&shard_id) else {
                continue;
            };
            let consumer = ShardConsumer::new(
                shard_id.clone(),
                self.checkpoints.get(&shard_id),
                state.bootstrap_to_latest(),
                Arc::clone(&self.reader.source),
                Arc::clone(&self.reader.processor),
                Arc::clone(&self.reader.checkpoint_store),
                self.reader.options.poll_interval,
            );

            self.topology.set_processing_active(&shard_id, true);
            self.active += 1;

            let shutdown = self.reader.shutdown.clone();
            let status_tx = self.status_tx.clone();
            let span = info_span!("shard", %shard_id);
            self.tasks.spawn(
                async move {
                    let outcome = AssertUnwindSafe(consumer.run(shutdown))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            ShardOutcome::Failed(Error::TaskPanicked {
                                shard_id: shard_id.clone(),
                            })
                        });
                    // the receiver is only dropped once every active task has reported
                    let _ = status_tx.send(ShardStatus { shard_id, outcome });
                }
                .instrument(span),
            );
        }
    }

    fn handle_status(&mut self, status: ShardStatus) -> Result<()> {
        let ShardStatus { shard_id, outcome } = status;
        self.active = self.active.saturating_sub(1);
        if !self.topology.set_processing_active(&shard_id, false) {
            debug!(%shard_id, "status reported for shard no longer in topology");
        }

        match outcome {
            ShardOutcome::Finished => {
                info!(%shard_id, "shard finished");
                self.topology.mark_locally_finished(&shard_id);
                Ok(())
            }
            ShardOutcome::Stopped => {
                debug!(%shard_id, "shard task stopped");
                Ok(())
            }
            ShardOutcome::Failed(error) => {
                error!(%shard_id, %error, "shard task failed");
                Err(error)
            }
        }
    }

    /// Signal every task to stop and wait for all of them to report back.
    async fn shutdown(&mut self) {
        self.reader.shutdown.cancel();

        while self.active > 0 {
            debug!(active = self.active, "waiting for shard tasks to stop");
            let Some(status) = self.status_rx.recv().await else {
                break;
            };
            if let Err(error) = self.handle_status(status) {
                warn!(%error, "shard task failed while shutting down");
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        checkpoint::{CheckpointError, MemoryCheckpointStore},
        mock::{FailingCheckpointStore, MockStreamSource, RecordingProcessor, records, wait_for},
        shard::SequenceNumber,
        source::{IteratorPosition, StreamStatus},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn seq(n: u64) -> SequenceNumber {
        SequenceNumber::from(n)
    }

    fn id(id: &str) -> ShardId {
        ShardId::from(id)
    }

    struct Harness {
        source: Arc<MockStreamSource>,
        processor: Arc<RecordingProcessor>,
        reader: Arc<Reader>,
    }

    impl Harness {
        fn new(
            source: MockStreamSource,
            processor: RecordingProcessor,
            store: Arc<dyn CheckpointStore>,
            bootstrap_position: BootstrapPosition,
        ) -> Self {
            let source = Arc::new(source);
            let processor = Arc::new(processor);
            let reader = Arc::new(Reader::new(ReaderArgs {
                source: Arc::clone(&source) as Arc<dyn StreamSource>,
                processor: Arc::clone(&processor) as Arc<dyn Processor>,
                checkpoint_store: store,
                options: ReaderOptions {
                    bootstrap_position,
                    poll_interval: Duration::from_millis(1),
                },
                span: None,
            }));
            Self {
                source,
                processor,
                reader,
            }
        }

        fn spawn(&self) -> tokio::task::JoinHandle<Result<()>> {
            let reader = Arc::clone(&self.reader);
            tokio::spawn(async move { reader.run().await })
        }

        async fn wait_for_records(&self, shard: &str, n: usize) {
            let processor = Arc::clone(&self.processor);
            let shard = id(shard);
            wait_for(move || processor.records(&shard).len() >= n, TIMEOUT).await;
        }

        async fn wait_for_requests(&self, n: usize) {
            let source = Arc::clone(&self.source);
            wait_for(move || source.iterator_requests().len() >= n, TIMEOUT).await;
        }
    }

    fn checkpoint(shard: &str, n: u64) -> Checkpoint {
        Checkpoint::new(shard, Utc::now(), seq(n))
    }

    #[test_log::test(tokio::test)]
    async fn cold_start_at_latest_requests_tip_iterator() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 5));
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Latest,
        );
        let run = h.spawn();

        h.wait_for_requests(1).await;
        assert_eq!(
            h.source.iterator_requests(),
            vec![(id("s1"), IteratorPosition::Latest)]
        );

        // only records written after startup are delivered
        h.source.push_records(&id("s1"), records(6, 2));
        h.wait_for_records("s1", 2).await;
        assert_eq!(h.processor.sequence_numbers(&id("s1")), vec![seq(6), seq(7)]);

        h.reader.stop();
        run.await.unwrap().unwrap();
        assert_eq!(h.source.iterator_requests().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn cold_start_at_oldest_replays_history() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 3));
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Oldest,
        );
        let run = h.spawn();

        h.wait_for_records("s1", 3).await;
        assert_eq!(
            h.source.iterator_requests(),
            vec![(id("s1"), IteratorPosition::TrimHorizon)]
        );

        h.reader.stop();
        run.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn bootstrap_at_latest_skips_closed_history() {
        let source = MockStreamSource::new();
        source.add_shard(
            ShardDescriptor::open("parent", seq(1)).closed_at(seq(3)),
            records(1, 3),
        );
        source.add_shard(
            ShardDescriptor::open("child", seq(4)).with_parent("parent"),
            records(4, 2),
        );
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Latest,
        );
        let run = h.spawn();

        h.wait_for_requests(1).await;
        h.source.push_records(&id("child"), records(6, 1));
        h.wait_for_records("child", 1).await;

        h.reader.stop();
        run.await.unwrap().unwrap();

        assert_eq!(
            h.source.iterator_requests(),
            vec![(id("child"), IteratorPosition::Latest)]
        );
        assert!(h.processor.records(&id("parent")).is_empty());
        assert_eq!(h.processor.sequence_numbers(&id("child")), vec![seq(6)]);
    }

    #[test_log::test(tokio::test)]
    async fn bootstrap_policy_ignored_when_checkpoints_exist() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 4));
        source.add_shard(ShardDescriptor::open("s2", seq(1)), records(1, 2));
        let store = MemoryCheckpointStore::with_checkpoints([checkpoint("s1", 2)]);
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(store),
            BootstrapPosition::Latest,
        );
        let run = h.spawn();

        h.wait_for_records("s1", 2).await;
        h.wait_for_records("s2", 2).await;
        h.reader.stop();
        run.await.unwrap().unwrap();

        assert_eq!(h.processor.sequence_numbers(&id("s1")), vec![seq(3), seq(4)]);
        let mut requests = h.source.iterator_requests();
        requests.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            requests,
            vec![
                (id("s1"), IteratorPosition::AfterSequenceNumber(seq(2))),
                (id("s2"), IteratorPosition::TrimHorizon),
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn finished_parent_releases_split_children() {
        let source = MockStreamSource::new().with_page_size(2);
        source.add_shard(
            ShardDescriptor::open("parent", seq(1)).closed_at(seq(5)),
            records(1, 5),
        );
        source.add_shard(
            ShardDescriptor::open("left", seq(6)).with_parent("parent"),
            records(6, 2),
        );
        source.add_shard(
            ShardDescriptor::open("right", seq(8)).with_parent("parent"),
            records(8, 2),
        );
        let store = Arc::new(MemoryCheckpointStore::new());
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            BootstrapPosition::Oldest,
        );
        let run = h.spawn();

        h.wait_for_records("left", 2).await;
        h.wait_for_records("right", 2).await;
        h.reader.stop();
        run.await.unwrap().unwrap();

        let requested = h.source.requested_shards();
        assert_eq!(requested.len(), 3);
        assert_eq!(requested[0], id("parent"));
        assert_eq!(h.processor.shard_order()[0], id("parent"));
        assert_eq!(h.processor.records(&id("parent")).len(), 5);
        assert_eq!(
            store.get(&id("parent")).unwrap().sequence_number,
            seq(5)
        );
    }

    #[test_log::test(tokio::test)]
    async fn merged_child_starts_immediately_when_both_parents_checkpointed() {
        let source = MockStreamSource::new();
        source.add_shard(
            ShardDescriptor::open("s1", seq(1)).closed_at(seq(100)),
            records(1, 1),
        );
        source.add_shard(
            ShardDescriptor::open("s2", seq(101)).closed_at(seq(200)),
            records(101, 1),
        );
        source.add_shard(
            ShardDescriptor::open("s3", seq(201))
                .with_parent("s1")
                .with_adjacent_parent("s2"),
            records(201, 2),
        );
        let store =
            MemoryCheckpointStore::with_checkpoints([checkpoint("s1", 100), checkpoint("s2", 200)]);
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(store),
            BootstrapPosition::Latest,
        );
        let run = h.spawn();

        h.wait_for_records("s3", 2).await;
        h.reader.stop();
        run.await.unwrap().unwrap();

        assert_eq!(h.source.requested_shards(), vec![id("s3")]);
        assert_eq!(h.source.list_shards_calls(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn merged_child_waits_for_unfinished_adjacent_parent() {
        let source = MockStreamSource::new();
        source.add_shard(
            ShardDescriptor::open("s1", seq(1)).closed_at(seq(100)),
            records(1, 1),
        );
        source.add_shard(
            ShardDescriptor::open("s2", seq(101)).closed_at(seq(200)),
            records(101, 3),
        );
        source.add_shard(
            ShardDescriptor::open("s3", seq(201))
                .with_parent("s1")
                .with_adjacent_parent("s2"),
            records(201, 2),
        );
        let store = MemoryCheckpointStore::with_checkpoints([checkpoint("s1", 100)]);
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(store),
            BootstrapPosition::Latest,
        );
        let run = h.spawn();

        h.wait_for_records("s3", 2).await;
        h.reader.stop();
        run.await.unwrap().unwrap();

        assert_eq!(h.source.requested_shards(), vec![id("s2"), id("s3")]);
        assert_eq!(h.processor.shard_order(), vec![id("s2"), id("s3")]);
    }

    #[test_log::test(tokio::test)]
    async fn shard_listing_is_paginated() {
        let source = MockStreamSource::new().with_list_page_size(1);
        for shard in ["a", "b", "c"] {
            source.add_shard(ShardDescriptor::open(shard, seq(1)), records(1, 1));
        }
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Oldest,
        );
        let run = h.spawn();

        for shard in ["a", "b", "c"] {
            h.wait_for_records(shard, 1).await;
        }
        h.reader.stop();
        run.await.unwrap().unwrap();

        let mut requested = h.source.requested_shards();
        requested.sort();
        assert_eq!(requested, vec![id("a"), id("b"), id("c")]);
        assert!(h.source.list_shards_calls() >= 3);
    }

    #[test_log::test(tokio::test)]
    async fn finished_shard_still_listed_open_is_not_restarted() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 2));
        source.end_iteration(&id("s1"));
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Oldest,
        );
        let run = h.spawn();

        h.wait_for_records("s1", 2).await;
        // leave room for many refresh cycles
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.reader.stop();
        run.await.unwrap().unwrap();

        assert_eq!(
            h.source.iterator_requests(),
            vec![(id("s1"), IteratorPosition::TrimHorizon)]
        );
        assert_eq!(h.processor.sequence_numbers(&id("s1")), vec![seq(1), seq(2)]);
    }

    #[test_log::test(tokio::test)]
    async fn stop_during_refresh_starts_no_tasks() {
        let source = MockStreamSource::new().with_list_delay(Duration::from_millis(100));
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 3));
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Oldest,
        );
        let run = h.spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.reader.stop();
        run.await.unwrap().unwrap();

        assert_eq!(h.source.list_shards_calls(), 1);
        assert!(h.source.iterator_requests().is_empty());
        assert_eq!(h.processor.pages(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn truncated_listing_is_fatal() {
        let source = MockStreamSource::new().with_list_page_size(1);
        source.add_shard(ShardDescriptor::open("parent", seq(1)), records(1, 1));
        source.add_shard(
            ShardDescriptor::open("child", seq(2)).with_parent("parent"),
            records(2, 1),
        );
        source.truncate_listing();
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Oldest,
        );

        let err = h.reader.run().await.unwrap_err();
        assert!(matches!(err, Error::ListShards(_)), "{err}");
        assert_eq!(h.source.list_shards_calls(), 2);
        assert!(h.source.iterator_requests().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn inactive_stream_is_fatal() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 1));
        source.set_status(StreamStatus::Creating);
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Latest,
        );

        let err = h.reader.run().await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::StreamNotActive {
                    status: StreamStatus::Creating
                }
            ),
            "{err}"
        );
        assert!(h.source.iterator_requests().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn listing_failure_is_fatal() {
        let source = MockStreamSource::new();
        source.fail_list_shards("throttled");
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Latest,
        );

        let err = h.reader.run().await.unwrap_err();
        assert!(matches!(err, Error::ListShards(_)), "{err}");
        assert!(err.to_string().contains("throttled"), "{err}");
    }

    #[test_log::test(tokio::test)]
    async fn broken_shard_stops_whole_reader() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("healthy", seq(1)), records(1, 1));
        source.add_shard(ShardDescriptor::open("broken", seq(1)), records(1, 1));
        source.fail_records(&id("broken"));
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Oldest,
        );

        let err = h.reader.run().await.unwrap_err();
        let Error::Fetch { shard_id, .. } = err else {
            panic!("expected fetch error, got {err}");
        };
        assert_eq!(shard_id, id("broken"));
        // the failure stopped every other task too
        assert!(h.reader.stop_handle().is_stopped());
    }

    #[test_log::test(tokio::test)]
    async fn processor_failure_is_fatal() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 1));
        let h = Harness::new(
            source,
            RecordingProcessor::new().fail_on("s1"),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Oldest,
        );

        let err = h.reader.run().await.unwrap_err();
        assert!(matches!(err, Error::Processor { .. }), "{err}");
    }

    #[test_log::test(tokio::test)]
    async fn checkpoint_failure_is_fatal() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 1));
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(FailingCheckpointStore::default()),
            BootstrapPosition::Oldest,
        );

        let err = h.reader.run().await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::Checkpoint {
                    source: CheckpointError::Store(_),
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn panicking_processor_is_reported() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 1));
        let h = Harness::new(
            source,
            RecordingProcessor::new().panic_on("s1"),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Oldest,
        );

        let err = h.reader.run().await.unwrap_err();
        assert!(
            matches!(&err, Error::TaskPanicked { shard_id } if shard_id == &id("s1")),
            "{err}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn stop_is_idempotent_and_drains_tasks() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 0));
        source.add_shard(ShardDescriptor::open("s2", seq(1)), records(1, 0));
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Latest,
        );
        let run = h.spawn();
        h.wait_for_requests(2).await;

        let handle = h.reader.stop_handle();
        handle.stop();
        h.reader.stop();
        handle.stop();

        tokio::time::timeout(TIMEOUT, run)
            .await
            .expect("reader did not stop")
            .unwrap()
            .unwrap();
        assert!(handle.is_stopped());
        assert_eq!(h.processor.pages(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn stop_before_run_returns_cleanly() {
        let source = MockStreamSource::new();
        source.add_shard(ShardDescriptor::open("s1", seq(1)), records(1, 1));
        let h = Harness::new(
            source,
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Latest,
        );

        h.reader.stop();
        h.reader.run().await.unwrap();
        assert_eq!(h.source.list_shards_calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn reader_runs_only_once() {
        let h = Harness::new(
            MockStreamSource::new(),
            RecordingProcessor::new(),
            Arc::new(MemoryCheckpointStore::new()),
            BootstrapPosition::Latest,
        );
        h.reader.stop();
        h.reader.run().await.unwrap();
        assert!(matches!(h.reader.run().await, Err(Error::AlreadyStarted)));
    }
}
