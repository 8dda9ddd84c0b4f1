//! Durable checkpoints of control-plane state.
//!
//! A [`CheckpointWriter`] polls a [`VersionedSnapshotSource`] and, whenever the
//! version moved, hands the newest snapshot to a single background worker that
//! persists it through a [`DurableStore`]. At most one write is in flight;
//! versions that appear while it runs are coalesced into the next write.

mod error;
mod file;
mod source;
mod store;
mod writer;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use error::{CheckpointError, SnapshotError, StoreError, WriteFailure};
pub use file::FileStore;
pub use source::VersionedSnapshotSource;
pub use store::DurableStore;
pub use writer::{
    CheckpointConfig, CheckpointHandle, CheckpointStatusView, CheckpointWriter, TickOutcome,
    MIN_POLL_INTERVAL,
};

/// Immutable capture of control-plane state at one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    state: Arc<serde_json::Value>,
}

impl Snapshot {
    /// Wraps already-serialized state.
    pub fn new(version: u64, state: serde_json::Value) -> Self {
        Self {
            version,
            state: Arc::new(state),
        }
    }

    /// Version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Serialized state.
    pub fn state(&self) -> &serde_json::Value {
        &self.state
    }
}

/// What a [`DurableStore`] persists for one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Record identity; a newer write replaces the older one.
    pub key: String,
    /// Version of `state`.
    pub version: u64,
    /// Wall-clock time of the write, milliseconds since the epoch.
    pub written_at_ms: i64,
    /// Serialized source state.
    pub state: serde_json::Value,
}
