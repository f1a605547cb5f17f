//! Checkpoint managers
//!
//! A manager stores one small metadata document per checkpoint and lists
//! checkpoints newest first. The local manager keeps each checkpoint in a
//! directory named after its token.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CheckpointToken, CheckpointType};

/// Errors from checkpoint management
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// I/O error while reading or writing checkpoint files
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Metadata could not be encoded or decoded
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
    /// No checkpoint with this token
    #[error("checkpoint not found: {0}")]
    NotFound(CheckpointToken),
    /// The store has no checkpoint manager
    #[error("no checkpoint manager configured")]
    NotConfigured,
}

/// What a checkpoint records about the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// Checkpoint kind
    pub checkpoint_type: CheckpointType,
    /// Per-store checkpoint sequence number
    pub version: u64,
    /// Log begin address
    pub begin_address: u64,
    /// Log head address
    pub head_address: u64,
    /// Log read-only address
    pub read_only_address: u64,
    /// Log tail address
    pub tail_address: u64,
    /// Lock table entries at the time of the checkpoint
    pub lock_table_entries: usize,
    /// Creation time in microseconds since the Unix epoch
    pub created_at_micros: u64,
}

/// Stores and enumerates checkpoints.
pub trait CheckpointManager: Send + Sync {
    /// Persist a checkpoint's metadata.
    fn commit(&self, metadata: &CheckpointMetadata) -> Result<(), CheckpointError>;

    /// Tokens of all committed checkpoints, newest first.
    fn tokens(&self) -> Result<Vec<CheckpointToken>, CheckpointError>;

    /// Metadata of one checkpoint.
    fn metadata(&self, token: CheckpointToken) -> Result<CheckpointMetadata, CheckpointError>;

    /// Delete one checkpoint.
    fn purge(&self, token: CheckpointToken) -> Result<(), CheckpointError>;

    /// Delete every checkpoint except the newest; returns how many were removed.
    fn remove_outdated(&self) -> Result<usize, CheckpointError> {
        let outdated = self.tokens()?.into_iter().skip(1).collect::<Vec<_>>();
        for token in &outdated {
            self.purge(*token)?;
        }
        Ok(outdated.len())
    }
}

const METADATA_FILE: &str = "checkpoint.meta";

/// Checkpoint manager backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalCheckpointManager {
    base_dir: PathBuf,
}

impl LocalCheckpointManager {
    /// Manage checkpoints under `base_dir`, creating it if needed.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Base directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of one checkpoint
    pub fn checkpoint_dir(&self, token: CheckpointToken) -> PathBuf {
        self.base_dir.join(token.to_string())
    }

    fn metadata_path(&self, token: CheckpointToken) -> PathBuf {
        self.checkpoint_dir(token).join(METADATA_FILE)
    }

    fn read_metadata(path: &Path) -> Result<CheckpointMetadata, CheckpointError> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

impl CheckpointManager for LocalCheckpointManager {
    fn commit(&self, metadata: &CheckpointMetadata) -> Result<(), CheckpointError> {
        let dir = self.checkpoint_dir(metadata.token);
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_vec_pretty(metadata)?;
        // Write-then-rename so a torn write never looks like a committed checkpoint.
        let staging = dir.join(format!("{METADATA_FILE}.tmp"));
        fs::write(&staging, data)?;
        fs::rename(&staging, self.metadata_path(metadata.token))?;
        Ok(())
    }

    fn tokens(&self) -> Result<Vec<CheckpointToken>, CheckpointError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.base_dir)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(token) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            // Directories without readable metadata are incomplete checkpoints.
            if let Ok(metadata) = Self::read_metadata(&path.join(METADATA_FILE)) {
                found.push((metadata.created_at_micros, metadata.version, token));
            }
        }
        found.sort_unstable_by(|a, b| b.cmp(a));
        Ok(found.into_iter().map(|(_, _, token)| token).collect())
    }

    fn metadata(&self, token: CheckpointToken) -> Result<CheckpointMetadata, CheckpointError> {
        let path = self.metadata_path(token);
        if !path.exists() {
            return Err(CheckpointError::NotFound(token));
        }
        Self::read_metadata(&path)
    }

    fn purge(&self, token: CheckpointToken) -> Result<(), CheckpointError> {
        let dir = self.checkpoint_dir(token);
        if !dir.exists() {
            return Err(CheckpointError::NotFound(token));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }
}
