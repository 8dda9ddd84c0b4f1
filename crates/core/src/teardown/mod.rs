//! Dependency-ordered teardown of an application's units.

mod collaborators;
mod controller;
mod error;
mod graph;

pub use collaborators::{BatchTeardownExecutor, UnitRegistry};
pub use controller::{TeardownConfig, TeardownController, TeardownOutcome};
pub use error::{ExecutorError, RegistryError, TeardownError};
pub use graph::ReverseDependencyMap;
