//! Deployment error taxonomy.

use thiserror::Error;

use flotilla_core::{PortError, ValidationError};
use flotilla_master::DriverError;
use flotilla_state::StateError;

pub type DeployResult<T> = Result<T, DeployError>;

/// Everything that can go wrong planning or executing a deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    ValidationFailed(#[from] ValidationError),

    #[error("unknown app: {0}")]
    UnknownApp(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("app locked by deployments: {}", .0.join(", "))]
    AppLocked(Vec<String>),

    #[error("conflicting change: {0}")]
    ConflictingChange(String),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Store(#[from] StateError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("artifact resolution failed for {0}")]
    ResolveArtifactFailed(String),

    #[error("deployment {0} canceled")]
    Canceled(String),

    #[error("timed out: {0}")]
    Timeout(String),
}
