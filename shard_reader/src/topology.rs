//! The process-local view of a stream's shards and their lineage.

use hashbrown::{HashMap, hash_map::Entry};

use crate::{
    checkpoint::Checkpoints,
    shard::{ShardDescriptor, ShardId, ShardState},
};

/// Every currently known shard of a stream, keyed by id.
///
/// A topology is owned by exactly one [`Reader`](crate::Reader), which is its only mutator, so
/// it carries no internal locking.
#[derive(Debug, Default)]
pub struct ShardTopology {
    shards: HashMap<ShardId, ShardState>,
    /// Incremented by every [`update`](Self::update); a shard whose
    /// [`ShardState::seen_generation`] lags behind it was missing from the latest refresh.
    generation: u64,
}

/// What changed in a [`ShardTopology::update`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopologyUpdate {
    /// Shards seen for the first time, sorted by id.
    pub added: Vec<ShardId>,
    /// Shards no longer reported by the stream, sorted by id.
    pub removed: Vec<ShardId>,
}

impl TopologyUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl ShardTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a full shard listing into the topology.
    ///
    /// New shards are inserted as inactive and unfinished. Known shards get their descriptor
    /// refreshed (an open shard may have closed since the last listing) but keep their runtime
    /// state. Shards absent from `shards` have expired past the stream's retention and are
    /// removed.
    pub fn update(&mut self, shards: impl IntoIterator<Item = ShardDescriptor>) -> TopologyUpdate {
        self.generation += 1;
        let generation = self.generation;
        let mut delta = TopologyUpdate::default();

        for descriptor in shards {
            match self.shards.entry(descriptor.shard_id.clone()) {
                Entry::Occupied(mut e) => {
                    let state = e.get_mut();
                    state.descriptor = descriptor;
                    state.seen_generation = generation;
                }
                Entry::Vacant(e) => {
                    delta.added.push(descriptor.shard_id.clone());
                    e.insert(ShardState::new(descriptor, generation));
                }
            }
        }

        self.shards.retain(|shard_id, state| {
            let seen = state.seen_generation == generation;
            if !seen {
                delta.removed.push(shard_id.clone());
            }
            seen
        });

        delta.added.sort();
        delta.removed.sort();
        delta
    }

    pub fn get(&self, shard_id: &ShardId) -> Option<&ShardState> {
        self.shards.get(shard_id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardState> {
        self.shards.values()
    }

    /// Whether the shard's parent has been fully consumed.
    ///
    /// A shard without a parent, or whose parent has already been retired from the stream, is
    /// never held back by it.
    pub fn parent_finished(&self, shard: &ShardState, checkpoints: &Checkpoints) -> bool {
        self.lineage_finished(shard.descriptor.parent_shard_id.as_ref(), checkpoints)
    }

    /// Same as [`parent_finished`](Self::parent_finished) for the second parent of a merged
    /// shard.
    pub fn adjacent_parent_finished(&self, shard: &ShardState, checkpoints: &Checkpoints) -> bool {
        self.lineage_finished(
            shard.descriptor.adjacent_parent_shard_id.as_ref(),
            checkpoints,
        )
    }

    fn lineage_finished(&self, shard_id: Option<&ShardId>, checkpoints: &Checkpoints) -> bool {
        let Some(shard_id) = shard_id else {
            return true;
        };
        match self.shards.get(shard_id) {
            Some(parent) => parent.is_finished(checkpoints.get(shard_id)),
            None => true,
        }
    }

    /// Whether every declared parent of `shard` has been fully consumed.
    pub fn lineage_ready(&self, shard: &ShardState, checkpoints: &Checkpoints) -> bool {
        self.parent_finished(shard, checkpoints) && self.adjacent_parent_finished(shard, checkpoints)
    }

    /// Shards that can have a consumption task started now: not already being processed, not
    /// finished, and with every parent finished. Sorted by id.
    ///
    /// A shard whose task reported the end of the shard is never started again, even if the
    /// listing still shows it as open.
    pub fn eligible_shards(&self, checkpoints: &Checkpoints) -> Vec<ShardId> {
        let mut eligible: Vec<ShardId> = self
            .shards
            .values()
            .filter(|s| !s.processing_active && !s.locally_finished)
            .filter(|s| !s.is_finished(checkpoints.get(s.shard_id())))
            .filter(|s| self.lineage_ready(s, checkpoints))
            .map(|s| s.shard_id().clone())
            .collect();
        eligible.sort();
        eligible
    }

    /// Returns false if the shard is unknown.
    pub(crate) fn set_processing_active(&mut self, shard_id: &ShardId, active: bool) -> bool {
        match self.shards.get_mut(shard_id) {
            Some(state) => {
                state.processing_active = active;
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_locally_finished(&mut self, shard_id: &ShardId) {
        if let Some(state) = self.shards.get_mut(shard_id) {
            state.locally_finished = true;
        }
    }

    pub(crate) fn mark_bootstrap_to_latest(&mut self, shard_id: &ShardId) {
        if let Some(state) = self.shards.get_mut(shard_id) {
            state.bootstrap_to_latest = true;
        }
    }
}
