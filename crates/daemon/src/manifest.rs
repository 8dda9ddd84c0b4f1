use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context};
use fleet_core::memory::ClusterState;
use fleet_core::model::{ApplicationName, Machine, Resources, Unit};
use serde::Deserialize;

/// Initial cluster contents loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub machines: Vec<Machine>,
    #[serde(default)]
    pub applications: Vec<ApplicationSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSpec {
    pub name: ApplicationName,
    pub units: Vec<UnitSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    pub machine: String,
    #[serde(default)]
    pub requires: BTreeSet<String>,
    #[serde(default)]
    pub resources: Resources,
}

impl Manifest {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading manifest {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing manifest {}", path.display()))
    }

    /// Registers machines, then deploys units so that dependencies always go
    /// first regardless of the order they are listed in.
    pub fn apply(&self, state: &ClusterState) -> anyhow::Result<()> {
        for machine in &self.machines {
            state.add_machine(machine.clone())?;
        }

        for app in &self.applications {
            let mut pending: Vec<&UnitSpec> = app.units.iter().collect();
            let mut deployed: BTreeSet<&str> = BTreeSet::new();

            while !pending.is_empty() {
                let (ready, blocked): (Vec<&UnitSpec>, Vec<&UnitSpec>) = pending.into_iter().partition(|u| {
                    u.requires
                        .iter()
                        .all(|d| d == &u.name || deployed.contains(d.as_str()))
                });
                if ready.is_empty() {
                    let names: Vec<&str> = blocked.iter().map(|u| u.name.as_str()).collect();
                    bail!("application {}: cannot order units {:?}; missing or cyclic dependencies", app.name, names);
                }
                for spec in ready {
                    let unit = Unit {
                        name: spec.name.clone(),
                        application: app.name.clone(),
                        requires: spec.requires.clone(),
                    };
                    state
                        .deploy(unit, &spec.machine, spec.resources)
                        .with_context(|| format!("deploying {}/{}", app.name, spec.name))?;
                    deployed.insert(spec.name.as_str());
                }
                pending = blocked;
            }
        }
        Ok(())
    }
}
