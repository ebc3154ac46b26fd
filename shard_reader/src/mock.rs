//! In-memory stand-ins for the stream service, the processor and the checkpoint store.
//!
//! [`MockStreamSource`] simulates a stream whose shards can be closed, split and merged while a
//! reader is consuming it, and records every call made against it.

use std::time::Duration;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::{
    DynError,
    checkpoint::{Checkpoint, CheckpointError, CheckpointStore, Checkpoints},
    processor::{Processor, ShardHandle},
    shard::{SequenceNumber, ShardDescriptor, ShardId},
    source::{
        IteratorPosition, Record, RecordPage, ShardIterator, ShardListPage, StreamSource,
        StreamStatus,
    },
};

const DEFAULT_PAGE_SIZE: usize = 10;
const DEFAULT_LIST_PAGE_SIZE: usize = 100;

#[derive(Debug)]
struct MockShard {
    descriptor: ShardDescriptor,
    records: Vec<Record>,
}

#[derive(Debug, Default)]
struct InjectedFailures {
    list_shards: Option<String>,
    iterator: HashSet<ShardId>,
    records: HashSet<ShardId>,
    /// Shards whose iteration ends at their last record although they are listed as open.
    ended: HashSet<ShardId>,
    truncated_listing: bool,
}

#[derive(Debug)]
struct MockState {
    status: StreamStatus,
    /// In listing order.
    shards: Vec<MockShard>,
    page_size: usize,
    list_page_size: usize,
    list_delay: Option<Duration>,
    /// Issued iterators, mapped to the shard and record offset they point at.
    iterators: HashMap<String, (ShardId, usize)>,
    next_iterator: u64,
    iterator_requests: Vec<(ShardId, IteratorPosition)>,
    list_shards_calls: usize,
    failures: InjectedFailures,
}

impl MockState {
    fn shard(&self, shard_id: &ShardId) -> Option<&MockShard> {
        self.shards
            .iter()
            .find(|s| &s.descriptor.shard_id == shard_id)
    }

    fn shard_mut(&mut self, shard_id: &ShardId) -> Option<&mut MockShard> {
        self.shards
            .iter_mut()
            .find(|s| &s.descriptor.shard_id == shard_id)
    }

    fn issue_iterator(&mut self, shard_id: ShardId, offset: usize) -> ShardIterator {
        self.next_iterator += 1;
        let id = format!("{shard_id}/{}", self.next_iterator);
        self.iterators.insert(id.clone(), (shard_id, offset));
        ShardIterator::new(id)
    }
}

/// A scripted, in-memory [`StreamSource`].
#[derive(Debug)]
pub struct MockStreamSource {
    state: Mutex<MockState>,
}

impl Default for MockStreamSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStreamSource {
    /// An active stream with no shards.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                status: StreamStatus::Active,
                shards: vec![],
                page_size: DEFAULT_PAGE_SIZE,
                list_page_size: DEFAULT_LIST_PAGE_SIZE,
                list_delay: None,
                iterators: HashMap::new(),
                next_iterator: 0,
                iterator_requests: vec![],
                list_shards_calls: 0,
                failures: InjectedFailures::default(),
            }),
        }
    }

    /// Maximum number of records returned by a single fetch.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state.lock().page_size = page_size.max(1);
        self
    }

    /// Maximum number of shards returned by a single listing call.
    pub fn with_list_page_size(self, list_page_size: usize) -> Self {
        self.state.lock().list_page_size = list_page_size.max(1);
        self
    }

    /// Delay every listing call by `delay`.
    pub fn with_list_delay(self, delay: Duration) -> Self {
        self.state.lock().list_delay = Some(delay);
        self
    }

    /// Add a shard holding `records`. Replaces an existing shard with the same id.
    pub fn add_shard(&self, descriptor: ShardDescriptor, records: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock();
        let shard = MockShard {
            descriptor,
            records: records.into_iter().collect(),
        };
        match state.shard_mut(&shard.descriptor.shard_id) {
            Some(existing) => *existing = shard,
            None => state.shards.push(shard),
        }
    }

    /// Append records to an existing shard. Unknown shards are ignored.
    pub fn push_records(&self, shard_id: &ShardId, records: impl IntoIterator<Item = Record>) {
        if let Some(shard) = self.state.lock().shard_mut(shard_id) {
            shard.records.extend(records);
        }
    }

    /// Close an existing shard at `ending`.
    pub fn close_shard(&self, shard_id: &ShardId, ending: SequenceNumber) {
        if let Some(shard) = self.state.lock().shard_mut(shard_id) {
            shard.descriptor.sequence_number_range.ending = Some(ending);
        }
    }

    /// Drop a shard from the listing, as if it had expired past retention.
    pub fn remove_shard(&self, shard_id: &ShardId) {
        self.state
            .lock()
            .shards
            .retain(|s| &s.descriptor.shard_id != shard_id);
    }

    pub fn set_status(&self, status: StreamStatus) {
        self.state.lock().status = status;
    }

    /// Make every following [`StreamSource::list_shards`] call fail with `message`.
    pub fn fail_list_shards(&self, message: impl Into<String>) {
        self.state.lock().failures.list_shards = Some(message.into());
    }

    /// Make every following [`StreamSource::shard_iterator`] call for `shard_id` fail.
    pub fn fail_iterator(&self, shard_id: &ShardId) {
        self.state.lock().failures.iterator.insert(shard_id.clone());
    }

    /// Make every following [`StreamSource::records`] call for `shard_id` fail.
    pub fn fail_records(&self, shard_id: &ShardId) {
        self.state.lock().failures.records.insert(shard_id.clone());
    }

    /// Make fetches of `shard_id` report the end of the shard once its records are exhausted,
    /// while the listing keeps showing it as open.
    pub fn end_iteration(&self, shard_id: &ShardId) {
        self.state.lock().failures.ended.insert(shard_id.clone());
    }

    /// Make every listing page after the first come back empty while still claiming more shards.
    pub fn truncate_listing(&self) {
        self.state.lock().failures.truncated_listing = true;
    }

    /// Every iterator requested so far, in request order.
    pub fn iterator_requests(&self) -> Vec<(ShardId, IteratorPosition)> {
        self.state.lock().iterator_requests.clone()
    }

    /// Shards an iterator was requested for, in request order.
    pub fn requested_shards(&self) -> Vec<ShardId> {
        self.state
            .lock()
            .iterator_requests
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn list_shards_calls(&self) -> usize {
        self.state.lock().list_shards_calls
    }
}

#[async_trait]
impl StreamSource for MockStreamSource {
    async fn list_shards(
        &self,
        exclusive_start_shard_id: Option<&ShardId>,
    ) -> Result<ShardListPage, DynError> {
        let delay = self.state.lock().list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.list_shards_calls += 1;
        if let Some(message) = &state.failures.list_shards {
            return Err(message.clone().into());
        }
        if state.failures.truncated_listing && exclusive_start_shard_id.is_some() {
            return Ok(ShardListPage {
                status: state.status,
                shards: vec![],
                has_more_shards: true,
            });
        }

        let start = exclusive_start_shard_id
            .and_then(|id| state.shards.iter().position(|s| &s.descriptor.shard_id == id))
            .map(|i| i + 1)
            .unwrap_or(0);
        let end = (start + state.list_page_size).min(state.shards.len());
        let shards = state.shards[start.min(end)..end]
            .iter()
            .map(|s| s.descriptor.clone())
            .collect();

        Ok(ShardListPage {
            status: state.status,
            shards,
            has_more_shards: end < state.shards.len(),
        })
    }

    async fn shard_iterator(
        &self,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ShardIterator, DynError> {
        let mut state = self.state.lock();
        state
            .iterator_requests
            .push((shard_id.clone(), position.clone()));
        if state.failures.iterator.contains(shard_id) {
            return Err(format!("injected iterator failure for shard {shard_id}").into());
        }

        let shard = state
            .shard(shard_id)
            .ok_or_else(|| format!("shard {shard_id} not found"))?;
        let offset = match position {
            IteratorPosition::Latest => shard.records.len(),
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::AfterSequenceNumber(sequence_number) => shard
                .records
                .iter()
                .position(|r| &r.sequence_number > sequence_number)
                .unwrap_or(shard.records.len()),
        };

        Ok(state.issue_iterator(shard_id.clone(), offset))
    }

    async fn records(&self, iterator: &ShardIterator) -> Result<RecordPage, DynError> {
        let mut state = self.state.lock();
        let (shard_id, offset) = state
            .iterators
            .get(iterator.as_str())
            .cloned()
            .ok_or_else(|| format!("unknown iterator {}", iterator.as_str()))?;
        if state.failures.records.contains(&shard_id) {
            return Err(format!("injected fetch failure for shard {shard_id}").into());
        }

        let page_size = state.page_size;
        let shard = state
            .shard(&shard_id)
            .ok_or_else(|| format!("shard {shard_id} not found"))?;
        let end = (offset + page_size).min(shard.records.len());
        let records = shard.records[offset.min(end)..end].to_vec();
        let exhausted = (shard.descriptor.is_closed() || state.failures.ended.contains(&shard_id))
            && end >= shard.records.len();
        let millis_behind_latest = if end >= shard.records.len() { 0 } else { 1000 };

        let next_iterator = (!exhausted).then(|| state.issue_iterator(shard_id, end));
        Ok(RecordPage {
            records,
            next_iterator,
            millis_behind_latest,
        })
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    records: HashMap<ShardId, Vec<Record>>,
    /// Shards in the order their first page was delivered.
    shard_order: Vec<ShardId>,
    pages: usize,
}

/// A [`Processor`] that remembers everything it was handed.
///
/// By default it checkpoints the last record of every page.
#[derive(Debug)]
pub struct RecordingProcessor {
    state: Mutex<RecordingState>,
    checkpoint_every_page: bool,
    fail_on: Option<ShardId>,
    panic_on: Option<ShardId>,
}

impl Default for RecordingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecordingState::default()),
            checkpoint_every_page: true,
            fail_on: None,
            panic_on: None,
        }
    }

    pub fn without_checkpoints(mut self) -> Self {
        self.checkpoint_every_page = false;
        self
    }

    /// Return an error for any page of `shard_id`.
    pub fn fail_on(mut self, shard_id: impl Into<ShardId>) -> Self {
        self.fail_on = Some(shard_id.into());
        self
    }

    /// Panic on any page of `shard_id`.
    pub fn panic_on(mut self, shard_id: impl Into<ShardId>) -> Self {
        self.panic_on = Some(shard_id.into());
        self
    }

    /// Records delivered for `shard_id`, in delivery order.
    pub fn records(&self, shard_id: &ShardId) -> Vec<Record> {
        self.state
            .lock()
            .records
            .get(shard_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn sequence_numbers(&self, shard_id: &ShardId) -> Vec<SequenceNumber> {
        self.records(shard_id)
            .into_iter()
            .map(|r| r.sequence_number)
            .collect()
    }

    /// Shards in the order their first page was delivered.
    pub fn shard_order(&self) -> Vec<ShardId> {
        self.state.lock().shard_order.clone()
    }

    pub fn pages(&self) -> usize {
        self.state.lock().pages
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process_records(
        &self,
        shard: &ShardHandle,
        records: Vec<Record>,
    ) -> Result<(), DynError> {
        let shard_id = shard.shard_id();
        if self.panic_on.as_ref() == Some(shard_id) {
            panic!("injected processor panic for shard {shard_id}");
        }
        if self.fail_on.as_ref() == Some(shard_id) {
            return Err(format!("injected processor failure for shard {shard_id}").into());
        }

        let last = records.last().map(|r| r.sequence_number.clone());
        {
            let mut state = self.state.lock();
            state.pages += 1;
            if !state.records.contains_key(shard_id) {
                state.shard_order.push(shard_id.clone());
            }
            state
                .records
                .entry(shard_id.clone())
                .or_default()
                .extend(records);
        }

        if self.checkpoint_every_page {
            if let Some(last) = last {
                shard.checkpoint(last).await?;
            }
        }
        Ok(())
    }
}

/// A [`CheckpointStore`] whose writes always fail.
#[derive(Debug, Default)]
pub struct FailingCheckpointStore {
    checkpoints: Checkpoints,
}

impl FailingCheckpointStore {
    /// A store that reports `checkpoints` on load but rejects every write.
    pub fn with_checkpoints(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Self {
        Self {
            checkpoints: checkpoints
                .into_iter()
                .map(|c| (c.shard_id.clone(), c))
                .collect(),
        }
    }
}

#[async_trait]
impl CheckpointStore for FailingCheckpointStore {
    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        Err(CheckpointError::Store(
            format!("injected write failure for shard {}", checkpoint.shard_id).into(),
        ))
    }

    async fn all_checkpoints(&self) -> Result<Checkpoints, CheckpointError> {
        Ok(self.checkpoints.clone())
    }
}

/// Build `n` records with consecutive sequence numbers starting at `first`.
pub fn records(first: u64, n: u64) -> Vec<Record> {
    (first..first + n)
        .map(|i| Record::new(SequenceNumber::from(i), format!("key-{i}"), format!("record {i}")))
        .collect()
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn wait_for<F>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> bool + Send,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(timeout, poll).await.is_err() {
        panic!("condition not met within {timeout:?}");
    }
}
