//! Durable per-shard progress.
//!
//! A [`Checkpoint`] records that every record at or before its sequence number has been fully
//! processed. The [`Reader`](crate::Reader) reads all checkpoints once on startup; after that,
//! checkpoints are only written, each shard by the single task that owns it.

use std::{
    fmt::Debug,
    io::Write,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    DynError,
    shard::{SequenceNumber, ShardId},
};

/// All checkpoints known to a store, keyed by shard.
pub type Checkpoints = HashMap<ShardId, Checkpoint>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub shard_id: ShardId,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: SequenceNumber,
}

impl Checkpoint {
    pub fn new(
        shard_id: impl Into<ShardId>,
        timestamp: DateTime<Utc>,
        sequence_number: SequenceNumber,
    ) -> Self {
        Self {
            shard_id: shard_id.into(),
            timestamp,
            sequence_number,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(
        "checkpoint for shard {shard_id} would move backwards from {current} to {attempted}"
    )]
    Regression {
        shard_id: ShardId,
        current: SequenceNumber,
        attempted: SequenceNumber,
    },

    #[error("checkpoint file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize or deserialize checkpoints: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint store error: {0}")]
    Store(#[source] DynError),
}

/// Durable storage of per-shard [`Checkpoint`]s.
///
/// Implementations must support concurrent [`set_checkpoint`](Self::set_checkpoint) calls for
/// different shards without losing any of them. They do not need to enforce that checkpoints
/// for a shard only move forwards; the [`ShardHandle`](crate::ShardHandle) that owns the shard
/// does that.
#[async_trait]
pub trait CheckpointStore: Debug + Send + Sync + 'static {
    /// Durably record `checkpoint`, replacing any previous checkpoint for the same shard.
    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;

    /// A snapshot of every stored checkpoint.
    async fn all_checkpoints(&self) -> Result<Checkpoints, CheckpointError>;
}

/// A [`CheckpointStore`] that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<Checkpoints>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `checkpoints`.
    pub fn with_checkpoints(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Self {
        Self {
            checkpoints: Mutex::new(
                checkpoints
                    .into_iter()
                    .map(|c| (c.shard_id.clone(), c))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, shard_id: &ShardId) -> Option<Checkpoint> {
        self.checkpoints.lock().get(shard_id).cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .lock()
            .insert(checkpoint.shard_id.clone(), checkpoint);
        Ok(())
    }

    async fn all_checkpoints(&self) -> Result<Checkpoints, CheckpointError> {
        Ok(self.checkpoints.lock().clone())
    }
}

/// A [`CheckpointStore`] backed by a single JSON file.
///
/// Every write rewrites the whole file through a temporary file in the same directory followed
/// by a rename, so a crash leaves either the old or the new contents on disk. Writes are
/// serialized through an async mutex.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    checkpoints: tokio::sync::Mutex<Checkpoints>,
}

impl FileCheckpointStore {
    /// Open the store at `path`, loading any checkpoints already written there. A missing file
    /// is treated as an empty store and created on the first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let checkpoints = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<Checkpoint> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|c| (c.shard_id.clone(), c)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Checkpoints::new(),
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %path.display(),
            n_checkpoints = checkpoints.len(),
            "opened checkpoint file"
        );
        Ok(Self {
            path,
            checkpoints: tokio::sync::Mutex::new(checkpoints),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CheckpointError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.lock().await;

        let mut updated = checkpoints.clone();
        updated.insert(checkpoint.shard_id.clone(), checkpoint);

        let mut list: Vec<&Checkpoint> = updated.values().collect();
        list.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        let contents = serde_json::to_vec_pretty(&list)?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &contents))
            .await
            .map_err(|e| CheckpointError::Store(Box::new(e)))??;

        debug!(path = %self.path.display(), "wrote checkpoint file");
        *checkpoints = updated;
        Ok(())
    }

    async fn all_checkpoints(&self) -> Result<Checkpoints, CheckpointError> {
        Ok(self.checkpoints.lock().await.clone())
    }
}
