//! Records describing machines, applications, units and their allocations.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of an application: a grouping of units torn down together.
///
/// Identity is the name itself and never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationName(String);

impl ApplicationName {
    /// Creates an application name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApplicationName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A deployed unit (service) tracked by the cluster manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Unique within its application.
    pub name: String,
    /// Application the unit belongs to.
    pub application: ApplicationName,
    /// Names of units this one requires to be present.
    #[serde(default)]
    pub requires: BTreeSet<String>,
}

impl Unit {
    /// Unit without dependencies.
    pub fn new(application: impl Into<ApplicationName>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            application: application.into(),
            requires: BTreeSet::new(),
        }
    }

    /// Builder-style: declare a dependency on `name`.
    pub fn requiring(mut self, name: impl Into<String>) -> Self {
        self.requires.insert(name.into());
        self
    }

    /// Unit name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of required units.
    pub fn requires(&self) -> &BTreeSet<String> {
        &self.requires
    }
}

/// A machine units can be allocated on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Unique machine name.
    pub name: String,
    /// Total CPU capacity in millicores.
    pub cpu_millis: u64,
    /// Total memory capacity in MB.
    pub mem_mb: u64,
}

/// Resources requested by a unit on a machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in MB.
    #[serde(default)]
    pub mem_mb: u64,
}

/// One unit's claim on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Application owning the unit.
    pub application: ApplicationName,
    /// Unit name within the application.
    pub unit: String,
    /// Machine the unit is placed on.
    pub machine: String,
    /// Capacity reserved on the machine.
    pub resources: Resources,
}
