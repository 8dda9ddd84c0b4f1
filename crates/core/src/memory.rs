//! In-memory cluster state and a local teardown executor.
//!
//! `ClusterState` is the single source both halves of the core read from: it
//! answers unit queries for teardown and produces versioned snapshots for
//! checkpointing. Every mutation bumps the version.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::checkpoint::{Snapshot, SnapshotError, VersionedSnapshotSource};
use crate::model::{Allocation, ApplicationName, Machine, Resources, Unit};
use crate::teardown::{BatchTeardownExecutor, ExecutorError, RegistryError, UnitRegistry};

/// First version of a freshly created [`ClusterState`].
pub const BASE_VERSION: u64 = 1;

/// Rejected mutation of a [`ClusterState`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// A machine with this name is already registered.
    #[error("machine {0} already exists")]
    DuplicateMachine(String),
    /// No machine with this name is registered.
    #[error("unknown machine {0}")]
    UnknownMachine(String),
    /// The unit is already deployed.
    #[error("unit {unit} already deployed in {application}")]
    DuplicateUnit {
        /// Owning application.
        application: ApplicationName,
        /// Unit name.
        unit: String,
    },
    /// A required unit is not deployed in the same application.
    #[error("unit {unit} requires {dependency}, which is not deployed in {application}")]
    UnknownDependency {
        /// Owning application.
        application: ApplicationName,
        /// Unit being deployed.
        unit: String,
        /// Missing requirement.
        dependency: String,
    },
    /// The unit is not deployed.
    #[error("unit {unit} not deployed in {application}")]
    UnknownUnit {
        /// Owning application.
        application: ApplicationName,
        /// Unit name.
        unit: String,
    },
    /// The machine lacks free capacity for the unit.
    #[error("machine {machine} cannot fit {requested:?}; free {free:?}")]
    InsufficientCapacity {
        /// Target machine.
        machine: String,
        /// Resources the unit asked for.
        requested: Resources,
        /// Resources still free on the machine.
        free: Resources,
    },
}

#[derive(Debug, Default, Serialize)]
struct Inner {
    version: u64,
    machines: BTreeMap<String, Machine>,
    applications: BTreeMap<ApplicationName, Vec<Unit>>,
    allocations: Vec<Allocation>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn free_on(&self, machine: &Machine) -> Resources {
        let used = self
            .allocations
            .iter()
            .filter(|a| a.machine == machine.name)
            .fold(Resources::default(), |acc, a| Resources {
                cpu_millis: acc.cpu_millis + a.resources.cpu_millis,
                mem_mb: acc.mem_mb + a.resources.mem_mb,
            });
        Resources {
            cpu_millis: machine.cpu_millis.saturating_sub(used.cpu_millis),
            mem_mb: machine.mem_mb.saturating_sub(used.mem_mb),
        }
    }
}

/// Shared, versioned view of machines, deployed units and their allocations.
#[derive(Debug, Clone)]
pub struct ClusterState {
    inner: Arc<Mutex<Inner>>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterState {
    /// Empty cluster at [`BASE_VERSION`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                version: BASE_VERSION,
                ..Inner::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a machine. Returns the new version.
    pub fn add_machine(&self, machine: Machine) -> Result<u64, ClusterError> {
        let mut inner = self.lock();
        if inner.machines.contains_key(&machine.name) {
            return Err(ClusterError::DuplicateMachine(machine.name));
        }
        inner.machines.insert(machine.name.clone(), machine);
        Ok(inner.bump())
    }

    /// Deploys `unit` on `machine`, reserving `resources` there.
    ///
    /// Every dependency must already be deployed in the same application.
    pub fn deploy(&self, unit: Unit, machine: &str, resources: Resources) -> Result<u64, ClusterError> {
        let mut inner = self.lock();

        let host = inner
            .machines
            .get(machine)
            .ok_or_else(|| ClusterError::UnknownMachine(machine.to_string()))?;
        let free = inner.free_on(host);
        if resources.cpu_millis > free.cpu_millis || resources.mem_mb > free.mem_mb {
            return Err(ClusterError::InsufficientCapacity {
                machine: machine.to_string(),
                requested: resources,
                free,
            });
        }

        let siblings = inner.applications.get(&unit.application);
        let deployed = |name: &str| siblings.is_some_and(|units| units.iter().any(|u| u.name == name));
        if deployed(&unit.name) {
            return Err(ClusterError::DuplicateUnit {
                application: unit.application,
                unit: unit.name,
            });
        }
        if let Some(missing) = unit.requires.iter().find(|d| *d != &unit.name && !deployed(d.as_str())) {
            return Err(ClusterError::UnknownDependency {
                application: unit.application.clone(),
                unit: unit.name.clone(),
                dependency: missing.clone(),
            });
        }

        inner.allocations.push(Allocation {
            application: unit.application.clone(),
            unit: unit.name.clone(),
            machine: machine.to_string(),
            resources,
        });
        info!(application = %unit.application, unit = %unit.name, machine, "unit deployed");
        inner.applications.entry(unit.application.clone()).or_default().push(unit);
        Ok(inner.bump())
    }

    /// Removes a unit and releases its allocation. Returns the new version.
    pub fn undeploy(&self, application: &ApplicationName, unit: &str) -> Result<u64, ClusterError> {
        let mut inner = self.lock();
        let units = inner
            .applications
            .get_mut(application)
            .ok_or_else(|| ClusterError::UnknownUnit {
                application: application.clone(),
                unit: unit.to_string(),
            })?;
        let before = units.len();
        units.retain(|u| u.name != unit);
        if units.len() == before {
            return Err(ClusterError::UnknownUnit {
                application: application.clone(),
                unit: unit.to_string(),
            });
        }
        if units.is_empty() {
            inner.applications.remove(application);
        }
        inner
            .allocations
            .retain(|a| !(a.application == *application && a.unit == unit));
        info!(application = %application, unit, "unit undeployed");
        Ok(inner.bump())
    }

    /// Applications that still have deployed units.
    pub fn applications(&self) -> Vec<ApplicationName> {
        self.lock().applications.keys().cloned().collect()
    }

    /// Allocations currently held on `machine`.
    pub fn allocations_on(&self, machine: &str) -> Vec<Allocation> {
        self.lock()
            .allocations
            .iter()
            .filter(|a| a.machine == machine)
            .cloned()
            .collect()
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.lock().version
    }
}

impl UnitRegistry for ClusterState {
    fn live_units(&self, application: &ApplicationName) -> Result<Vec<Unit>, RegistryError> {
        Ok(self
            .lock()
            .applications
            .get(application)
            .cloned()
            .unwrap_or_default())
    }
}

impl VersionedSnapshotSource for ClusterState {
    fn current_version(&self) -> u64 {
        self.version()
    }

    /// Only the latest state is kept, so any version up to the current one is
    /// answered with the current state.
    fn snapshot_at(&self, version: u64) -> Result<Snapshot, SnapshotError> {
        let inner = self.lock();
        if version > inner.version {
            return Err(SnapshotError::VersionAhead {
                requested: version,
                current: inner.version,
            });
        }
        let state = serde_json::to_value(&*inner)?;
        Ok(Snapshot::new(inner.version, state))
    }
}

/// Undeploys units straight from a [`ClusterState`].
#[derive(Debug, Clone)]
pub struct LocalTeardownExecutor {
    state: ClusterState,
    per_unit_delay: Duration,
}

impl LocalTeardownExecutor {
    /// Executor removing units from `state` without delay.
    pub fn new(state: ClusterState) -> Self {
        Self {
            state,
            per_unit_delay: Duration::ZERO,
        }
    }

    /// Waits `delay` before removing each unit, simulating a slow drain.
    pub fn with_per_unit_delay(mut self, delay: Duration) -> Self {
        self.per_unit_delay = delay;
        self
    }

    async fn undeploy_all(&self, units: &[Unit]) -> Result<(), ExecutorError> {
        for unit in units {
            if !self.per_unit_delay.is_zero() {
                tokio::time::sleep(self.per_unit_delay).await;
            }
            match self.state.undeploy(&unit.application, &unit.name) {
                Ok(_) => {}
                // Someone else removed it first.
                Err(ClusterError::UnknownUnit { .. }) => {
                    debug!(application = %unit.application, unit = %unit.name, "unit already gone");
                }
                Err(e) => {
                    return Err(ExecutorError::Undeploy {
                        unit: unit.name.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

impl BatchTeardownExecutor for LocalTeardownExecutor {
    async fn undeploy(&self, units: &[Unit], timeout: Duration) -> Result<bool, ExecutorError> {
        match tokio::time::timeout(timeout, self.undeploy_all(units)).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterState {
        let state = ClusterState::new();
        state
            .add_machine(Machine {
                name: "m1".into(),
                cpu_millis: 4_000,
                mem_mb: 8_192,
            })
            .unwrap();
        state
    }

    fn small() -> Resources {
        Resources {
            cpu_millis: 500,
            mem_mb: 512,
        }
    }

    #[test]
    fn every_mutation_bumps_the_version() {
        let state = cluster();
        let v0 = state.version();
        assert_eq!(v0, BASE_VERSION + 1);

        let v1 = state.deploy(Unit::new("shop", "db"), "m1", small()).unwrap();
        let v2 = state.undeploy(&"shop".into(), "db").unwrap();

        assert_eq!(v1, v0 + 1);
        assert_eq!(v2, v1 + 1);
        assert_eq!(state.current_version(), v2);
    }

    #[test]
    fn deploy_requires_dependencies_in_same_application() {
        let state = cluster();
        state.deploy(Unit::new("other", "db"), "m1", small()).unwrap();

        let err = state
            .deploy(Unit::new("shop", "web").requiring("db"), "m1", small())
            .unwrap_err();
        assert!(matches!(err, ClusterError::UnknownDependency { .. }));
    }

    #[test]
    fn deploy_rejects_overcommit() {
        let state = cluster();
        let big = Resources {
            cpu_millis: 3_000,
            mem_mb: 1_024,
        };
        state.deploy(Unit::new("shop", "a"), "m1", big).unwrap();

        let err = state.deploy(Unit::new("shop", "b"), "m1", big).unwrap_err();
        assert!(matches!(err, ClusterError::InsufficientCapacity { .. }));
    }

    #[test]
    fn undeploy_releases_allocation() {
        let state = cluster();
        state.deploy(Unit::new("shop", "db"), "m1", small()).unwrap();
        assert_eq!(state.allocations_on("m1").len(), 1);

        state.undeploy(&"shop".into(), "db").unwrap();

        assert!(state.allocations_on("m1").is_empty());
        assert!(state.applications().is_empty());
        assert!(state.live_units(&"shop".into()).unwrap().is_empty());
    }

    #[test]
    fn snapshot_carries_current_version_and_state() {
        let state = cluster();
        state.deploy(Unit::new("shop", "db"), "m1", small()).unwrap();
        let current = state.current_version();

        let snap = state.snapshot_at(current - 1).unwrap();
        assert_eq!(snap.version(), current);
        assert_eq!(snap.state()["allocations"][0]["unit"], "db");

        let err = state.snapshot_at(current + 1).unwrap_err();
        assert!(matches!(err, SnapshotError::VersionAhead { .. }));
    }

    #[tokio::test]
    async fn executor_tolerates_units_removed_concurrently() {
        let state = cluster();
        state.deploy(Unit::new("shop", "db"), "m1", small()).unwrap();
        let units = state.live_units(&"shop".into()).unwrap();
        state.undeploy(&"shop".into(), "db").unwrap();

        let executor = LocalTeardownExecutor::new(state.clone());
        let done = executor.undeploy(&units, Duration::from_secs(1)).await.unwrap();
        assert!(done);
    }
}
