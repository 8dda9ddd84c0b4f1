use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::error::StoreError;
use super::CheckpointRecord;

/// Persists checkpoint records so they survive a restart.
pub trait DurableStore: Send + Sync {
    /// Writes `record`, replacing any record with the same key. The record may
    /// be discarded by the store once `ttl` has elapsed.
    fn put(
        &self,
        record: &CheckpointRecord,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<T: DurableStore> DurableStore for Arc<T> {
    fn put(
        &self,
        record: &CheckpointRecord,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).put(record, ttl)
    }
}
