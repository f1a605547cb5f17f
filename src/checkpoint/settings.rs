//! Checkpoint settings carried by the store configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{CheckpointError, CheckpointManager, LocalCheckpointManager};

/// Kind of checkpoint the store takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Write a separate snapshot of the in-memory log
    #[default]
    Snapshot,
    /// Flush the in-memory log in place and move the read-only marker
    FoldOver,
}

impl CheckpointType {
    /// Name used in configuration files
    pub const fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Snapshot => "snapshot",
            CheckpointType::FoldOver => "fold_over",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "snapshot" => Ok(CheckpointType::Snapshot),
            "fold_over" | "foldover" => Ok(CheckpointType::FoldOver),
            other => Err(format!("unknown checkpoint type: {other}")),
        }
    }
}

/// Checkpoint settings.
///
/// Either `checkpoint_manager` or `checkpoint_dir` selects where checkpoint
/// metadata goes; an explicit manager wins. With neither set the store does
/// not take checkpoints.
#[derive(Clone, Default)]
pub struct CheckpointSettings {
    /// Kind of checkpoint
    pub checkpoint_type: CheckpointType,
    /// Manager that stores and enumerates checkpoints
    pub checkpoint_manager: Option<Arc<dyn CheckpointManager>>,
    /// Directory for a local checkpoint manager
    pub checkpoint_dir: Option<PathBuf>,
    /// Keep only the newest checkpoint after each commit
    pub remove_outdated: bool,
    /// Pause before each checkpoint flush
    pub throttle_checkpoint_flush_delay: Option<Duration>,
}

impl CheckpointSettings {
    /// Settings with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the checkpoint type
    pub fn with_checkpoint_type(mut self, checkpoint_type: CheckpointType) -> Self {
        self.checkpoint_type = checkpoint_type;
        self
    }

    /// Use an explicit checkpoint manager
    pub fn with_checkpoint_manager(mut self, manager: Arc<dyn CheckpointManager>) -> Self {
        self.checkpoint_manager = Some(manager);
        self
    }

    /// Store checkpoints under `dir` with a local manager
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Remove outdated checkpoints after each commit
    pub fn with_remove_outdated(mut self, remove_outdated: bool) -> Self {
        self.remove_outdated = remove_outdated;
        self
    }

    /// Pause for `delay` before each checkpoint flush
    pub fn with_throttle_checkpoint_flush_delay(mut self, delay: Duration) -> Self {
        self.throttle_checkpoint_flush_delay = Some(delay);
        self
    }

    /// The manager these settings select, if any.
    pub fn resolve_manager(&self) -> Result<Option<Arc<dyn CheckpointManager>>, CheckpointError> {
        if let Some(manager) = &self.checkpoint_manager {
            return Ok(Some(Arc::clone(manager)));
        }
        match &self.checkpoint_dir {
            Some(dir) => Ok(Some(Arc::new(LocalCheckpointManager::new(dir)?))),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for CheckpointSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointSettings")
            .field("checkpoint_type", &self.checkpoint_type)
            .field("checkpoint_manager", &self.checkpoint_manager.is_some())
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("remove_outdated", &self.remove_outdated)
            .field(
                "throttle_checkpoint_flush_delay",
                &self.throttle_checkpoint_flush_delay,
            )
            .finish()
    }
}
