//! Backend error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving an execution substrate.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("image build failed: {0}")]
    Build(String),

    #[error("environment provisioning failed: {0}")]
    Provision(String),

    #[error("instance failed to run: {0}")]
    Run(String),

    #[error("`{program}` timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("`{program}` exited with {status:?}: {stderr}")]
    Command {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("core error: {0}")]
    Core(#[from] modelgrid_core::CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),
}

pub type BackendResult<T> = Result<T, BackendError>;
