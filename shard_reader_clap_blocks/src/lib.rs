//! Command line and environment configuration for a shard reader.

use std::{path::PathBuf, sync::Arc, time::Duration};

use shard_reader::{
    BootstrapPosition, CheckpointError, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore, ReaderOptions,
};
use tracing::{info, warn};

/// Where to start reading a stream that has never been checkpointed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BootstrapPositionArg {
    /// Skip existing history and only read records written from now on.
    #[default]
    Latest,
    /// Replay every shard from the oldest retained record.
    Oldest,
}

impl From<BootstrapPositionArg> for BootstrapPosition {
    fn from(value: BootstrapPositionArg) -> Self {
        match value {
            BootstrapPositionArg::Latest => Self::Latest,
            BootstrapPositionArg::Oldest => Self::Oldest,
        }
    }
}

/// CLI config for the shard reader.
#[derive(Debug, Clone, clap::Parser)]
pub struct ShardReaderConfig {
    /// Where to start reading when no checkpoint exists for any shard of the stream.
    ///
    /// Ignored as soon as a single checkpoint has been written.
    #[clap(
        long = "bootstrap-position",
        env = "SHARD_READER_BOOTSTRAP_POSITION",
        default_value = "latest",
        ignore_case = true,
        action
    )]
    pub bootstrap_position: BootstrapPositionArg,

    /// How long a shard task waits between two record fetches.
    #[clap(
        long = "poll-interval",
        env = "SHARD_READER_POLL_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub poll_interval: Duration,

    /// File to persist checkpoints in.
    ///
    /// Without it, checkpoints are only kept in memory and every restart bootstraps again.
    #[clap(long = "checkpoint-file", env = "SHARD_READER_CHECKPOINT_FILE", action)]
    pub checkpoint_file: Option<PathBuf>,
}

impl ShardReaderConfig {
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            bootstrap_position: self.bootstrap_position.into(),
            poll_interval: self.poll_interval,
        }
    }

    /// Open the configured checkpoint store.
    pub async fn checkpoint_store(&self) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
        match &self.checkpoint_file {
            Some(path) => {
                info!(path = %path.display(), "using file checkpoint store");
                Ok(Arc::new(FileCheckpointStore::open(path.clone()).await?))
            }
            None => {
                warn!("no checkpoint file configured, checkpoints will not survive a restart");
                Ok(Arc::new(MemoryCheckpointStore::new()))
            }
        }
    }
}

impl From<&ShardReaderConfig> for ReaderOptions {
    fn from(config: &ShardReaderConfig) -> Self {
        config.reader_options()
    }
}
