use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::model::{ApplicationName, Unit};

use super::collaborators::{BatchTeardownExecutor, UnitRegistry};
use super::error::TeardownError;
use super::graph::ReverseDependencyMap;

/// First wait while accepted units are still visible in the registry.
const SETTLE_MIN: Duration = Duration::from_millis(1);
/// Cap for the doubling wait between registry re-reads.
const SETTLE_MAX: Duration = Duration::from_millis(250);

/// Settings for [`TeardownController`].
#[derive(Debug, Clone)]
pub struct TeardownConfig {
    /// Budget used by [`TeardownController::teardown_default`].
    pub default_timeout: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// How a teardown ended when it did not hit a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// No live units remain.
    Completed {
        /// Batches handed to the executor.
        rounds: u32,
    },
    /// The deadline passed, either between rounds or while a batch was running.
    TimedOut {
        /// Units still live when time ran out.
        remaining: Vec<String>,
    },
    /// The executor reported that a batch did not fully undeploy.
    BatchFailed {
        /// Units in the failed batch.
        batch: Vec<String>,
        /// Executor's explanation.
        reason: String,
    },
}

impl TeardownOutcome {
    /// True only for [`TeardownOutcome::Completed`].
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Tears down an application's units leaves-first.
///
/// Each round re-reads the live units, so removals made concurrently by
/// other actors are picked up instead of following a stale order. Units the
/// executor has accepted are not sent again; while they are still visible
/// the controller waits for the registry to catch up.
pub struct TeardownController<R, E> {
    registry: R,
    executor: E,
    cfg: TeardownConfig,
}

impl<R, E> TeardownController<R, E>
where
    R: UnitRegistry,
    E: BatchTeardownExecutor,
{
    /// Controller reading `registry` and undeploying through `executor`.
    pub fn new(registry: R, executor: E, cfg: TeardownConfig) -> Self {
        Self {
            registry,
            executor,
            cfg,
        }
    }

    /// Tears down `application` within `budget`.
    ///
    /// `Ok(false)` means the application may still have live units; callers
    /// can retry with a fresh budget. A dependency cycle is an error.
    pub async fn teardown(
        &self,
        application: &ApplicationName,
        budget: Duration,
    ) -> Result<bool, TeardownError> {
        Ok(self.teardown_detailed(application, budget).await?.is_complete())
    }

    /// [`Self::teardown`] with the configured default budget.
    pub async fn teardown_default(&self, application: &ApplicationName) -> Result<bool, TeardownError> {
        self.teardown(application, self.cfg.default_timeout).await
    }

    /// Like [`Self::teardown`] but keeps timeouts and batch failures apart.
    pub async fn teardown_detailed(
        &self,
        application: &ApplicationName,
        budget: Duration,
    ) -> Result<TeardownOutcome, TeardownError> {
        let deadline = Instant::now() + budget;
        let mut rounds = 0u32;
        let mut accepted: BTreeSet<String> = BTreeSet::new();
        let mut settle = SETTLE_MIN;

        loop {
            let live = self.live_units(application)?;
            if live.is_empty() {
                info!(application = %application, rounds, "teardown complete");
                return Ok(TeardownOutcome::Completed { rounds });
            }
            accepted.retain(|name| live.iter().any(|u| &u.name == name));

            let reverse = ReverseDependencyMap::build(&live);
            let batch: Vec<Unit> = reverse
                .eligible(&live)
                .into_iter()
                .filter(|u| !accepted.contains(&u.name))
                .cloned()
                .collect();

            let left = deadline.saturating_duration_since(Instant::now());
            if batch.is_empty() {
                if accepted.is_empty() {
                    let remaining = unit_names(&live);
                    warn!(application = %application, ?remaining, "cyclic dependency blocks teardown");
                    return Err(TeardownError::CyclicDependency {
                        application: application.clone(),
                        remaining,
                    });
                }
                if left.is_zero() {
                    return Ok(timed_out(application, &live));
                }
                trace!(application = %application, pending = ?accepted, wait = ?settle, "waiting for removals to show");
                tokio::time::sleep(settle.min(left)).await;
                settle = (settle * 2).min(SETTLE_MAX);
                continue;
            }

            if left.is_zero() {
                return Ok(timed_out(application, &live));
            }

            rounds += 1;
            let names = unit_names(&batch);
            debug!(application = %application, round = rounds, batch = ?names, "undeploying batch");

            match timeout(left, self.executor.undeploy(&batch, left)).await {
                Ok(Ok(true)) => {
                    accepted.extend(names);
                    settle = SETTLE_MIN;
                }
                Ok(Ok(false)) => {
                    warn!(application = %application, batch = ?names, "batch not fully undeployed");
                    return Ok(TeardownOutcome::BatchFailed {
                        batch: names,
                        reason: "executor reported incomplete undeploy".into(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(application = %application, batch = ?names, error = %e, "batch undeploy failed");
                    return Ok(TeardownOutcome::BatchFailed {
                        batch: names,
                        reason: e.to_string(),
                    });
                }
                Err(_) => return Ok(timed_out(application, &live)),
            }
        }
    }

    fn live_units(&self, application: &ApplicationName) -> Result<Vec<Unit>, TeardownError> {
        let mut live = self.registry.live_units(application)?;
        live.retain(|u| &u.application == application);
        Ok(live)
    }
}

fn timed_out(application: &ApplicationName, live: &[Unit]) -> TeardownOutcome {
    let remaining = unit_names(live);
    warn!(application = %application, ?remaining, "teardown timed out");
    TeardownOutcome::TimedOut { remaining }
}

fn unit_names(units: &[Unit]) -> Vec<String> {
    units.iter().map(|u| u.name.clone()).collect()
}
