//! Checkpoint settings and management
//!
//! The store records its log markers in a small metadata document per
//! checkpoint. How the log itself is persisted is left to the device layer;
//! this module only names checkpoints, stores their metadata and prunes old
//! ones.

mod manager;
mod settings;

pub use manager::{CheckpointError, CheckpointManager, CheckpointMetadata, LocalCheckpointManager};
pub use settings::{CheckpointSettings, CheckpointType};

use uuid::Uuid;

/// Token identifying a checkpoint
pub type CheckpointToken = Uuid;
