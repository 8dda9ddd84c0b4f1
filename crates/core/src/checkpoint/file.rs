use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::now_ms;

use super::error::StoreError;
use super::store::DurableStore;
use super::CheckpointRecord;

/// On-disk envelope: the record plus when it stops being valid.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    expires_at_ms: i64,
    record: CheckpointRecord,
}

/// [`DurableStore`] keeping one JSON file per key under a directory.
///
/// Writes go to a temporary file that is synced to disk and then renamed
/// over the previous record, so a crash mid-write leaves the older
/// checkpoint intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `dir`; the directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    /// Reads the record stored under `key`, ignoring it if it has expired.
    pub async fn load(&self, key: &str) -> Result<Option<CheckpointRecord>, StoreError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let stored: StoredRecord = serde_json::from_slice(&bytes)?;
        if stored.expires_at_ms <= now_ms() {
            debug!(key, path = %path.display(), "ignoring expired checkpoint");
            return Ok(None);
        }
        Ok(Some(stored.record))
    }
}

impl DurableStore for FileStore {
    async fn put(&self, record: &CheckpointRecord, ttl: Duration) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let stored = StoredRecord {
            expires_at_ms: expiry_ms(now_ms(), ttl),
            record: record.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&stored)?;

        let path = self.path_for(&record.key);
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&bytes).await.map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        debug!(key = %record.key, version = record.version, path = %path.display(), "record stored");
        Ok(())
    }
}

/// Saturates instead of wrapping for TTLs beyond the `i64` range.
fn expiry_ms(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
