use std::time::Duration;

use fleet_core::checkpoint::{CheckpointConfig, CheckpointError, CheckpointWriter, FileStore};
use fleet_core::memory::{ClusterState, LocalTeardownExecutor};
use fleet_core::model::ApplicationName;
use fleet_core::teardown::{TeardownConfig, TeardownController, TeardownError, TeardownOutcome};
use tokio::time::Instant;
use tracing::{info, warn};

/// Owns the cluster state and the two control-plane loops reading it.
pub struct FleetService {
    state: ClusterState,
    controller: TeardownController<ClusterState, LocalTeardownExecutor>,
    checkpoints: CheckpointWriter<ClusterState>,
}

impl FleetService {
    /// Starts checkpointing `state` into `store`; the first tick writes it.
    pub fn start(
        state: ClusterState,
        store: FileStore,
        checkpoint_cfg: CheckpointConfig,
        teardown_cfg: TeardownConfig,
        drain_delay: Duration,
    ) -> Self {
        let checkpoints = CheckpointWriter::spawn(state.clone(), store, checkpoint_cfg);
        let executor = LocalTeardownExecutor::new(state.clone()).with_per_unit_delay(drain_delay);
        let controller = TeardownController::new(state.clone(), executor, teardown_cfg);

        Self {
            state,
            controller,
            checkpoints,
        }
    }

    /// Cluster state shared with the control loops.
    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Tears down `application` within `budget`, then waits up to the same
    /// budget for the resulting state to be checkpointed.
    pub async fn teardown(&self, application: &ApplicationName, budget: Duration) -> Result<bool, TeardownError> {
        let outcome = self.controller.teardown_detailed(application, budget).await?;
        match &outcome {
            TeardownOutcome::Completed { rounds } => {
                info!(application = %application, rounds, "application torn down");
            }
            TeardownOutcome::TimedOut { remaining } => {
                warn!(application = %application, ?remaining, "teardown ran out of time; retry later");
            }
            TeardownOutcome::BatchFailed { batch, reason } => {
                warn!(application = %application, ?batch, reason, "teardown batch failed");
            }
        }

        if let Err(e) = self.wait_durable(budget).await {
            warn!(application = %application, error = %e, "post-teardown state not yet durable");
        }
        Ok(outcome.is_complete())
    }

    /// Polls `verify_durable` until it succeeds, fails hard, or `within` elapses.
    pub async fn wait_durable(&self, within: Duration) -> Result<(), CheckpointError> {
        let deadline = Instant::now() + within;
        let pause = self.checkpoints.config().poll_interval.min(Duration::from_millis(250));
        loop {
            match self.checkpoints.verify_durable() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && Instant::now() < deadline => {
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stops the checkpoint loops, letting an in-flight write finish.
    pub async fn shutdown(mut self) {
        self.checkpoints.close().await;
        match self.checkpoints.verify_durable() {
            Ok(()) => info!(version = self.state.version(), "final state is durable"),
            Err(e) => warn!(error = %e, "final state may not be durable"),
        }
    }
}
