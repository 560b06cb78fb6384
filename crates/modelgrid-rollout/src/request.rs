//! Workflow inputs and reports.

use modelgrid_core::ServeArgs;
use serde::{Deserialize, Serialize};

use crate::controller::LifecyclePhase;

/// Deploy `name:version` into `stage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub name: String,
    pub version: String,
    /// Raw stage text; validated when the identity is resolved.
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub args: ServeArgs,
    #[serde(default)]
    pub batch_prediction: bool,
    /// Scheduled-job definition for batch deployments.
    #[serde(default)]
    pub job: Option<serde_json::Value>,
    /// Reuse a suffix when retrying an attempt.
    #[serde(default)]
    pub suffix: Option<String>,
}

/// Remove every instance of `name:version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndeployRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub stage: String,
    /// Also remove the scheduled jobs of the removed instances.
    #[serde(default)]
    pub batch_prediction: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReport {
    pub deployment_name: String,
    pub port: u16,
    /// Deployment names of the superseded instances.
    pub removed: Vec<String>,
    /// Best-effort steps that failed without failing the deploy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub phases: Vec<LifecyclePhase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndeployReport {
    pub removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub phases: Vec<LifecyclePhase>,
}
