use thiserror::Error;

use crate::model::ApplicationName;

/// Failure reading units from a [`super::UnitRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry could not be reached or answered garbage.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by a [`super::BatchTeardownExecutor`] for one batch.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A specific unit could not be undeployed.
    #[error("failed to undeploy {unit}: {reason}")]
    Undeploy {
        /// Unit that failed.
        unit: String,
        /// Executor's explanation.
        reason: String,
    },
    /// Any other executor failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Fatal teardown failures. Running out of time is not one of them.
#[derive(Debug, Error)]
pub enum TeardownError {
    /// Every remaining unit still has a live dependent. Retrying cannot help;
    /// the declared dependencies must be fixed.
    #[error("cyclic dependency in application {application} among units {remaining:?}")]
    CyclicDependency {
        /// Application being torn down.
        application: ApplicationName,
        /// Units left when no progress was possible.
        remaining: Vec<String>,
    },
    /// The registry could not be read.
    #[error("reading live units: {0}")]
    Registry(#[from] RegistryError),
}
