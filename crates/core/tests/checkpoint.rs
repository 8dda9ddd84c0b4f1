//! Checkpoint writer behaviour against a store whose writes can be held open.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_core::checkpoint::{
    CheckpointConfig, CheckpointError, CheckpointRecord, CheckpointWriter, DurableStore, Snapshot,
    SnapshotError, StoreError, TickOutcome, VersionedSnapshotSource, WriteFailure,
    MIN_POLL_INTERVAL,
};
use tokio::sync::Semaphore;

struct CountingSource {
    version: AtomicU64,
    broken: AtomicBool,
}

impl CountingSource {
    fn at(version: u64) -> Arc<Self> {
        Arc::new(Self {
            version: AtomicU64::new(version),
            broken: AtomicBool::new(false),
        })
    }

    fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl VersionedSnapshotSource for CountingSource {
    fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn snapshot_at(&self, version: u64) -> Result<Snapshot, SnapshotError> {
        if self.broken.load(Ordering::SeqCst) {
            let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            return Err(SnapshotError::Encode(bad));
        }
        Ok(Snapshot::new(version, serde_json::json!({ "version": version })))
    }
}

/// Each `put` waits for a permit; `started` records versions as writes begin.
struct GatedStore {
    gate: Semaphore,
    started: Mutex<Vec<u64>>,
    landed: Mutex<Vec<u64>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    failing: AtomicBool,
}

impl GatedStore {
    fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(permits),
            started: Mutex::new(Vec::new()),
            landed: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    fn open() -> Arc<Self> {
        Self::new(1_000)
    }

    fn started(&self) -> Vec<u64> {
        self.started.lock().unwrap().clone()
    }

    fn landed(&self) -> Vec<u64> {
        self.landed.lock().unwrap().clone()
    }
}

impl DurableStore for GatedStore {
    async fn put(&self, record: &CheckpointRecord, _ttl: Duration) -> Result<(), StoreError> {
        self.started.lock().unwrap().push(record.version);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        self.landed.lock().unwrap().push(record.version);
        Ok(())
    }
}

fn manual_config() -> CheckpointConfig {
    CheckpointConfig {
        key: "test-state".into(),
        poll_interval: Duration::from_secs(3600),
        record_ttl: Duration::from_secs(60),
        shutdown_grace: Duration::from_millis(200),
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn settle<S: VersionedSnapshotSource + 'static>(writer: &CheckpointWriter<S>) {
    wait_for("write to finish", || !writer.status().in_flight).await;
}

#[tokio::test]
async fn resumed_at_current_version_writes_nothing() {
    let source = CountingSource::at(5);
    let store = GatedStore::open();
    let writer = CheckpointWriter::resume(Arc::clone(&source), Arc::clone(&store), manual_config(), 5);

    for _ in 0..10 {
        assert_eq!(writer.tick(), TickOutcome::Unchanged);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(store.started().is_empty());
    assert!(writer.verify_durable().is_ok());
}

#[tokio::test]
async fn unchanged_version_is_written_once() {
    let source = CountingSource::at(3);
    let store = GatedStore::open();
    let writer = CheckpointWriter::spawn(Arc::clone(&source), Arc::clone(&store), manual_config());

    assert_eq!(writer.tick(), TickOutcome::Submitted(3));
    settle(&writer).await;
    for _ in 0..5 {
        assert_eq!(writer.tick(), TickOutcome::Unchanged);
    }

    assert_eq!(store.landed(), vec![3]);
    assert!(writer.verify_durable().is_ok());
}

#[tokio::test]
async fn versions_during_a_write_coalesce_into_one_more_write() {
    let source = CountingSource::at(1);
    let store = GatedStore::new(0);
    let writer = CheckpointWriter::spawn(Arc::clone(&source), Arc::clone(&store), manual_config());

    assert_eq!(writer.tick(), TickOutcome::Submitted(1));
    wait_for("first write to start", || store.started().len() == 1).await;

    source.bump();
    assert_eq!(writer.tick(), TickOutcome::InFlight);
    source.bump();
    assert_eq!(writer.tick(), TickOutcome::InFlight);
    assert!(matches!(
        writer.verify_durable(),
        Err(CheckpointError::BackupInProgress { written: 0, current: 3, .. })
    ));

    store.gate.add_permits(1);
    settle(&writer).await;
    assert_eq!(writer.status().last_written_version, 1);

    assert_eq!(writer.tick(), TickOutcome::Submitted(3));
    store.gate.add_permits(1);
    settle(&writer).await;

    assert_eq!(store.started(), vec![1, 3]);
    assert_eq!(store.max_active.load(Ordering::SeqCst), 1);
    assert!(writer.verify_durable().is_ok());
}

#[tokio::test]
async fn verify_durable_tracks_bumps_writes_and_failures() {
    let source = CountingSource::at(1);
    let store = GatedStore::open();
    let writer = CheckpointWriter::spawn(Arc::clone(&source), Arc::clone(&store), manual_config());

    writer.tick();
    settle(&writer).await;
    assert!(writer.verify_durable().is_ok());

    // Bumped, not yet ticked.
    source.bump();
    let err = writer.verify_durable().unwrap_err();
    assert!(err.is_transient());

    store.failing.store(true, Ordering::SeqCst);
    writer.tick();
    settle(&writer).await;
    let failed = |w: &CheckpointWriter<Arc<CountingSource>>| match w.verify_durable() {
        Err(CheckpointError::BackupFailed { cause, .. }) => {
            assert!(matches!(
                cause.as_ref(),
                WriteFailure::Store(StoreError::Unavailable(m)) if m == "disk on fire"
            ));
            true
        }
        _ => false,
    };
    assert!(failed(&writer));

    // Retried on the next tick and still failing.
    writer.tick();
    settle(&writer).await;
    assert!(failed(&writer));
    assert_eq!(writer.status().last_written_version, 1);

    store.failing.store(false, Ordering::SeqCst);
    writer.tick();
    settle(&writer).await;
    assert!(writer.verify_durable().is_ok());
    assert_eq!(writer.status().last_error, None);
}

#[tokio::test]
async fn snapshot_failure_is_reported_as_backup_failed() {
    let source = CountingSource::at(4);
    source.broken.store(true, Ordering::SeqCst);
    let store = GatedStore::open();
    let writer = CheckpointWriter::spawn(Arc::clone(&source), Arc::clone(&store), manual_config());

    assert_eq!(writer.tick(), TickOutcome::SnapshotFailed);
    match writer.verify_durable() {
        Err(CheckpointError::BackupFailed { cause, .. }) => {
            assert!(matches!(cause.as_ref(), WriteFailure::Snapshot(_)));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!writer.status().in_flight);

    source.broken.store(false, Ordering::SeqCst);
    assert_eq!(writer.tick(), TickOutcome::Submitted(4));
    settle(&writer).await;
    assert!(writer.verify_durable().is_ok());
}

#[tokio::test]
async fn background_ticker_catches_up_with_latest_version() {
    let source = CountingSource::at(1);
    let store = GatedStore::open();
    let cfg = CheckpointConfig {
        poll_interval: Duration::from_millis(10),
        ..manual_config()
    };
    let handle = {
        let writer = CheckpointWriter::spawn(Arc::clone(&source), Arc::clone(&store), cfg);
        let handle = writer.handle();
        wait_for("initial write", || handle.verify_durable().is_ok()).await;

        for _ in 0..5 {
            source.bump();
        }
        wait_for("latest version durable", || handle.verify_durable().is_ok()).await;
        handle
    };

    assert_eq!(store.landed().last(), Some(&6));
    assert!(store.landed().len() <= 6);
    assert_eq!(store.max_active.load(Ordering::SeqCst), 1);
    // Writer dropped: the handle still answers without blocking.
    assert!(handle.verify_durable().is_ok());
}

#[tokio::test]
async fn zero_poll_interval_still_ticks() {
    let source = CountingSource::at(2);
    let store = GatedStore::open();
    let cfg = CheckpointConfig {
        poll_interval: Duration::ZERO,
        ..manual_config()
    };
    let mut writer = CheckpointWriter::spawn(Arc::clone(&source), Arc::clone(&store), cfg);
    assert_eq!(writer.config().poll_interval, MIN_POLL_INTERVAL);

    wait_for("initial write", || writer.verify_durable().is_ok()).await;
    source.bump();
    wait_for("bumped version durable", || writer.verify_durable().is_ok()).await;

    assert_eq!(store.landed().last(), Some(&3));
    writer.close().await;
}

#[tokio::test]
async fn close_lets_in_flight_write_finish() {
    let source = CountingSource::at(2);
    let store = GatedStore::new(0);
    let mut writer = CheckpointWriter::spawn(Arc::clone(&source), Arc::clone(&store), CheckpointConfig {
        shutdown_grace: Duration::from_secs(2),
        ..manual_config()
    });

    writer.tick();
    wait_for("write to start", || store.started().len() == 1).await;

    let opener = Arc::clone(&store);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        opener.gate.add_permits(1);
    });
    writer.close().await;

    assert_eq!(store.landed(), vec![2]);
    assert!(writer.verify_durable().is_ok());

    source.bump();
    assert_eq!(writer.tick(), TickOutcome::Closed);
}

#[tokio::test]
async fn close_abandons_a_stuck_write_after_grace() {
    let source = CountingSource::at(2);
    let store = GatedStore::new(0);
    let mut writer = CheckpointWriter::spawn(Arc::clone(&source), Arc::clone(&store), manual_config());

    writer.tick();
    wait_for("write to start", || store.started().len() == 1).await;

    writer.close().await;

    assert!(store.landed().is_empty());
    assert!(!writer.status().in_flight);
    assert!(matches!(
        writer.verify_durable(),
        Err(CheckpointError::BackupInProgress { .. })
    ));
    // Closing twice is a no-op.
    writer.close().await;
}
