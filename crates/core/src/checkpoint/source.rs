use std::sync::Arc;

use super::error::SnapshotError;
use super::Snapshot;

/// Produces monotonically versioned snapshots of control-plane state.
pub trait VersionedSnapshotSource: Send + Sync {
    /// Version of the live state. Never decreases.
    fn current_version(&self) -> u64;

    /// Snapshot of the state at `version`.
    ///
    /// Sources that only keep the latest state may answer with a newer
    /// version than requested; the writer records whatever version it gets.
    fn snapshot_at(&self, version: u64) -> Result<Snapshot, SnapshotError>;
}

impl<T: VersionedSnapshotSource + ?Sized> VersionedSnapshotSource for Arc<T> {
    fn current_version(&self) -> u64 {
        (**self).current_version()
    }

    fn snapshot_at(&self, version: u64) -> Result<Snapshot, SnapshotError> {
        (**self).snapshot_at(version)
    }
}
