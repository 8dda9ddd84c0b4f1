use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// A snapshot source could not produce the requested version.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The requested version has not been reached yet.
    #[error("version {requested} is ahead of current version {current}")]
    VersionAhead {
        /// Version asked for.
        requested: u64,
        /// Version the source is at.
        current: u64,
    },
    /// The state could not be serialized.
    #[error("serializing state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A durable store rejected a write.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The record could not be encoded or decoded.
    #[error("encoding record: {0}")]
    Encode(#[from] serde_json::Error),
    /// The backing service refused the write.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why the last checkpoint attempt did not land.
#[derive(Debug, Error)]
pub enum WriteFailure {
    /// The store rejected the record.
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
    /// No snapshot could be taken.
    #[error("taking snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Answer of [`super::CheckpointWriter::verify_durable`] when the latest
/// state is not known to be persisted.
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    /// The latest version has not been written yet. Retry shortly.
    #[error("checkpoint {key} in progress: durable version {written}, current version {current}")]
    BackupInProgress {
        /// Record key.
        key: String,
        /// Newest durable version.
        written: u64,
        /// Version the source is at.
        current: u64,
    },
    /// The last write attempt failed. The writer keeps retrying on its own.
    #[error("checkpoint {key} failed: {cause}")]
    BackupFailed {
        /// Record key.
        key: String,
        /// What went wrong.
        #[source]
        cause: Arc<WriteFailure>,
    },
}

impl CheckpointError {
    /// True for conditions expected to clear without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackupInProgress { .. })
    }
}
