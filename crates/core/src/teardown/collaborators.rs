use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::model::{ApplicationName, Unit};

use super::error::{ExecutorError, RegistryError};

/// Source of the live units of an application.
///
/// Each call returns an owned, consistent snapshot; the controller never
/// holds on to it across rounds.
pub trait UnitRegistry: Send + Sync {
    /// Live units of `application`, in registry order.
    fn live_units(&self, application: &ApplicationName) -> Result<Vec<Unit>, RegistryError>;
}

/// Removes batches of units.
///
/// Implementations are best-effort and should give up once `timeout` has
/// elapsed. `Ok(true)` means every unit in the batch was undeployed.
pub trait BatchTeardownExecutor: Send + Sync {
    /// Undeploy `units`, waiting at most `timeout`.
    fn undeploy(
        &self,
        units: &[Unit],
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, ExecutorError>> + Send;
}

impl<T: UnitRegistry + ?Sized> UnitRegistry for Arc<T> {
    fn live_units(&self, application: &ApplicationName) -> Result<Vec<Unit>, RegistryError> {
        (**self).live_units(application)
    }
}

impl<T: BatchTeardownExecutor> BatchTeardownExecutor for Arc<T> {
    fn undeploy(
        &self,
        units: &[Unit],
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, ExecutorError>> + Send {
        (**self).undeploy(units, timeout)
    }
}
