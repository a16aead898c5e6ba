//! Engine error types.

use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::errors::{JobStoreError, LifecycleError, RegistryError};
use crate::trigger::TriggerError;

/// Errors from [`ProcessEngine`](super::ProcessEngine) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("job store error: {0}")]
    JobStore(#[from] JobStoreError),
    /// The requested process key has no deployed definition.
    #[error("process not deployed: {key}")]
    ProcessNotDeployed { key: String },
    /// An error during engine construction.
    #[error("build error: {message}")]
    Build { message: String },
}
