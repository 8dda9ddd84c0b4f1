use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::{new_ulid, now_ms};

use super::error::{CheckpointError, WriteFailure};
use super::source::VersionedSnapshotSource;
use super::store::DurableStore;
use super::{CheckpointRecord, Snapshot};

/// Shortest poll interval the ticker runs at; shorter settings are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Settings for [`CheckpointWriter`].
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Key the record is stored under.
    pub key: String,
    /// How often the version is polled.
    pub poll_interval: Duration,
    /// Time-to-live passed to the store with every record.
    pub record_ttl: Duration,
    /// How long `close` waits for an in-flight write before abandoning it.
    pub shutdown_grace: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            key: "cluster-state".into(),
            poll_interval: Duration::from_secs(1),
            record_ttl: Duration::from_secs(24 * 60 * 60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// What one poll cycle decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Current version is already durable.
    Unchanged,
    /// A write is still running; the new version waits for a later tick.
    InFlight,
    /// A snapshot at this version was handed to the worker.
    Submitted(u64),
    /// The source could not produce a snapshot; recorded as the last error.
    SnapshotFailed,
    /// The worker has shut down.
    Closed,
}

/// Point-in-time view of the writer's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointStatusView {
    /// Key the record is stored under.
    pub key: String,
    /// Newest version known to be persisted.
    pub last_written_version: u64,
    /// Version the source reported when the view was taken.
    pub current_version: u64,
    /// Whether a write is running.
    pub in_flight: bool,
    /// Failure of the latest write attempt, if it failed.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct CheckpointStatus {
    last_written: AtomicU64,
    in_flight: AtomicBool,
    last_error: Mutex<Option<Arc<WriteFailure>>>,
}

impl CheckpointStatus {
    fn new(last_written: u64) -> Self {
        Self {
            last_written: AtomicU64::new(last_written),
            in_flight: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    fn last_written(&self) -> u64 {
        self.last_written.load(Ordering::Acquire)
    }

    fn last_error(&self) -> Option<Arc<WriteFailure>> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_error(&self, failure: Option<WriteFailure>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = failure.map(Arc::new);
    }

    fn try_claim(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    fn succeeded(&self, version: u64) {
        self.last_written.store(version, Ordering::Release);
        self.set_error(None);
        self.release();
    }

    fn failed(&self, failure: WriteFailure) {
        self.set_error(Some(failure));
        self.release();
    }
}

struct Shared<S> {
    source: S,
    cfg: CheckpointConfig,
    status: CheckpointStatus,
    work_tx: mpsc::Sender<Snapshot>,
}

impl<S: VersionedSnapshotSource> Shared<S> {
    fn tick(&self) -> TickOutcome {
        let current = self.source.current_version();
        if current == self.status.last_written() {
            return TickOutcome::Unchanged;
        }
        if !self.status.try_claim() {
            return TickOutcome::InFlight;
        }
        // The previous write may have landed this version between the two checks.
        if current == self.status.last_written() {
            self.status.release();
            return TickOutcome::Unchanged;
        }

        let snapshot = match self.source.snapshot_at(current) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %self.cfg.key, version = current, error = %e, "snapshot failed");
                self.status.failed(e.into());
                return TickOutcome::SnapshotFailed;
            }
        };

        let version = snapshot.version();
        match self.work_tx.try_send(snapshot) {
            Ok(()) => {
                debug!(key = %self.cfg.key, version, "checkpoint submitted");
                TickOutcome::Submitted(version)
            }
            Err(_) => {
                self.status.release();
                TickOutcome::Closed
            }
        }
    }

    fn verify_durable(&self) -> Result<(), CheckpointError> {
        if let Some(cause) = self.status.last_error() {
            return Err(CheckpointError::BackupFailed {
                key: self.cfg.key.clone(),
                cause,
            });
        }
        let written = self.status.last_written();
        let current = self.source.current_version();
        if written != current {
            return Err(CheckpointError::BackupInProgress {
                key: self.cfg.key.clone(),
                written,
                current,
            });
        }
        Ok(())
    }

    fn status(&self) -> CheckpointStatusView {
        CheckpointStatusView {
            key: self.cfg.key.clone(),
            last_written_version: self.status.last_written(),
            current_version: self.source.current_version(),
            in_flight: self.status.in_flight.load(Ordering::Acquire),
            last_error: self.status.last_error().map(|e| e.to_string()),
        }
    }

    async fn write<D: DurableStore>(&self, store: &D, snapshot: Snapshot) {
        let write_id = new_ulid();
        let record = CheckpointRecord {
            key: self.cfg.key.clone(),
            version: snapshot.version(),
            written_at_ms: now_ms(),
            state: snapshot.state().clone(),
        };

        let started = Instant::now();
        match store.put(&record, self.cfg.record_ttl).await {
            Ok(()) => {
                info!(
                    key = %record.key,
                    version = record.version,
                    %write_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "checkpoint written"
                );
                self.status.succeeded(record.version);
            }
            Err(e) => {
                warn!(key = %record.key, version = record.version, %write_id, error = %e, "checkpoint write failed");
                self.status.failed(e.into());
            }
        }
    }
}

/// Cloneable read-only access to a writer's durability state.
pub struct CheckpointHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for CheckpointHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: VersionedSnapshotSource> CheckpointHandle<S> {
    /// See [`CheckpointWriter::verify_durable`].
    pub fn verify_durable(&self) -> Result<(), CheckpointError> {
        self.shared.verify_durable()
    }

    /// See [`CheckpointWriter::status`].
    pub fn status(&self) -> CheckpointStatusView {
        self.shared.status()
    }
}

/// Background writer persisting the newest snapshot whenever the version moves.
///
/// Two tasks run per writer: a ticker that polls the source every
/// `poll_interval` and never waits on the store, and a worker that owns the
/// store and performs one write at a time. Dropping the writer stops both;
/// [`CheckpointWriter::close`] additionally waits for an in-flight write.
pub struct CheckpointWriter<S> {
    shared: Arc<Shared<S>>,
    shutdown: watch::Sender<bool>,
    tasks: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

impl<S> CheckpointWriter<S>
where
    S: VersionedSnapshotSource + 'static,
{
    /// Starts a writer whose first tick writes the current state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<D>(source: S, store: D, cfg: CheckpointConfig) -> Self
    where
        D: DurableStore + 'static,
    {
        // Wraps for a source starting at version 0, which still differs.
        let last_written = source.current_version().wrapping_sub(1);
        Self::start(source, store, cfg, last_written)
    }

    /// Starts a writer for state recovered from a checkpoint at
    /// `durable_version`; nothing is written until the version moves past it.
    pub fn resume<D>(source: S, store: D, cfg: CheckpointConfig, durable_version: u64) -> Self
    where
        D: DurableStore + 'static,
    {
        Self::start(source, store, cfg, durable_version)
    }

    fn start<D>(source: S, store: D, mut cfg: CheckpointConfig, last_written: u64) -> Self
    where
        D: DurableStore + 'static,
    {
        if cfg.poll_interval < MIN_POLL_INTERVAL {
            warn!(key = %cfg.key, requested = ?cfg.poll_interval, using = ?MIN_POLL_INTERVAL, "poll interval too short");
            cfg.poll_interval = MIN_POLL_INTERVAL;
        }
        let (work_tx, work_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            source,
            cfg,
            status: CheckpointStatus::new(last_written),
            work_tx,
        });

        info!(key = %shared.cfg.key, last_written, poll_ms = shared.cfg.poll_interval.as_millis() as u64, "checkpoint writer started");

        let ticker = tokio::spawn(run_ticker(Arc::clone(&shared), shutdown_rx.clone()));
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), store, work_rx, shutdown_rx));

        Self {
            shared,
            shutdown,
            tasks: Some((ticker, worker)),
        }
    }

    /// Runs one poll cycle immediately.
    pub fn tick(&self) -> TickOutcome {
        self.shared.tick()
    }

    /// Succeeds if the current version is known to be persisted.
    ///
    /// Never blocks on the store.
    pub fn verify_durable(&self) -> Result<(), CheckpointError> {
        self.shared.verify_durable()
    }

    /// Point-in-time view of the writer's state.
    pub fn status(&self) -> CheckpointStatusView {
        self.shared.status()
    }

    /// Settings in effect, after the poll interval was clamped.
    pub fn config(&self) -> &CheckpointConfig {
        &self.shared.cfg
    }

    /// Handle for callers that only need to check durability.
    pub fn handle(&self) -> CheckpointHandle<S> {
        CheckpointHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops ticking and waits up to `shutdown_grace` for an in-flight write.
    pub async fn close(&mut self) {
        let Some((ticker, mut worker)) = self.tasks.take() else {
            return;
        };
        let _ = self.shutdown.send(true);
        let _ = ticker.await;

        if timeout(self.shared.cfg.shutdown_grace, &mut worker).await.is_err() {
            warn!(key = %self.shared.cfg.key, "abandoning in-flight checkpoint write");
            worker.abort();
            self.shared.status.release();
        }
        info!(key = %self.shared.cfg.key, "checkpoint writer stopped");
    }
}

async fn run_ticker<S>(shared: Arc<Shared<S>>, mut shutdown: watch::Receiver<bool>)
where
    S: VersionedSnapshotSource,
{
    let period = shared.cfg.poll_interval;
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                let outcome = shared.tick();
                trace!(key = %shared.cfg.key, ?outcome, "checkpoint tick");
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_worker<S, D>(
    shared: Arc<Shared<S>>,
    store: D,
    mut work_rx: mpsc::Receiver<Snapshot>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: VersionedSnapshotSource,
    D: DurableStore,
{
    loop {
        let snapshot = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = work_rx.recv() => match next {
                Some(s) => s,
                None => break,
            },
        };
        shared.write(&store, snapshot).await;
    }
    // Anything still queued was never started.
    work_rx.close();
    if work_rx.try_recv().is_ok() {
        shared.status.release();
    }
}
