//! Deploy/undeploy failure taxonomy.

use std::time::Duration;

use modelgrid_backends::BackendError;
use modelgrid_core::{CoreError, RepositoryError};
use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("model {name}:{version} not found in the repository")]
    ModelNotFound { name: String, version: String },

    #[error("model repository error: {0}")]
    Repository(String),

    #[error("image build failed: {0}")]
    BuildFailure(String),

    #[error("environment provisioning failed: {0}")]
    ProvisionFailure(String),

    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("failed to stop previous instances: {}", .errors.join("; "))]
    StopFailed { errors: Vec<String> },

    #[error("{deployment_name} failed to run: {reason}")]
    RunFailure {
        deployment_name: String,
        reason: String,
        logs: Option<String>,
    },

    #[error("{deployment_name} did not become healthy")]
    HealthCheckFailed {
        deployment_name: String,
        logs: Option<String>,
    },

    #[error("no instance of {name}:{version} to remove")]
    NotFound { name: String, version: String },

    /// Restoring the previous instances failed after `cause`.
    /// Manual intervention is required.
    #[error("FAILED TO RESTORE previous instances ({}) after: {cause}", .restore_errors.join("; "))]
    RestoreFailed {
        cause: Box<DeployError>,
        restore_errors: Vec<String>,
    },

    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl DeployError {
    /// Log tail of the failed instance, when one was captured.
    pub fn logs(&self) -> Option<&str> {
        match self {
            DeployError::RunFailure { logs, .. } | DeployError::HealthCheckFailed { logs, .. } => {
                logs.as_deref()
            }
            DeployError::RestoreFailed { cause, .. } => cause.logs(),
            _ => None,
        }
    }

    /// Whether the error leaves the system in a state that needs an operator.
    pub fn needs_intervention(&self) -> bool {
        matches!(self, DeployError::RestoreFailed { .. })
    }
}

impl From<CoreError> for DeployError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidArgument(msg) => DeployError::InvalidArgument(msg),
            other => DeployError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<RepositoryError> for DeployError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound { name, version } => {
                DeployError::ModelNotFound { name, version }
            }
            other => DeployError::Repository(other.to_string()),
        }
    }
}
