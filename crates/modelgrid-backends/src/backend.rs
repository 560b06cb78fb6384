//! Capability traits every substrate implements.
//!
//! Two roles exist:
//!
//! * [`RuntimeBackend`]: hosts serving instances (containers, sessions).
//!   Owns the full lifecycle the coordinator drives.
//! * [`DependentBackend`]: side registrations that must follow the runtime
//!   instances in lockstep (scheduled jobs, monitoring targets). They never
//!   start anything, they only register and unregister entries.

use async_trait::async_trait;
use modelgrid_core::matching::select;
use modelgrid_core::{
    BackendKind, BundleRef, DeploymentIdentity, InstanceLabels, MatchCriteria, ModelSummary,
    RunningInstance,
};
use serde::Serialize;
use tracing::warn;

use crate::error::BackendResult;

/// Result of a stop/remove pass over matched instances.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopOutcome {
    /// Instances that were running and are now stopped.
    pub stopped: Vec<RunningInstance>,
    /// Instances that no longer exist.
    pub removed: Vec<RunningInstance>,
    /// Per-instance failures, `"{deployment_name}: {error}"`.
    pub errors: Vec<String>,
}

impl StopOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Build or provision everything `start` needs for this identity
    /// (image, environment). Starts nothing.
    async fn prepare(&self, identity: &DeploymentIdentity, bundle: &BundleRef) -> BackendResult<()>;

    /// Undo [`prepare`](Self::prepare) when the attempt is abandoned before
    /// anything was started.
    async fn discard_prepared(&self, identity: &DeploymentIdentity) -> BackendResult<()>;

    /// Start a new instance of `identity`, labelled with `labels`.
    async fn start(
        &self,
        identity: &DeploymentIdentity,
        bundle: &BundleRef,
        labels: &InstanceLabels,
    ) -> BackendResult<RunningInstance>;

    /// Bring a stopped instance back with its original arguments.
    async fn restart(&self, instance: &RunningInstance) -> BackendResult<()>;

    async fn stop(&self, instance: &RunningInstance) -> BackendResult<()>;

    /// Destroy the instance and the artifacts only it uses.
    async fn remove(&self, instance: &RunningInstance) -> BackendResult<()>;

    /// Every managed instance, stopped ones included.
    async fn list_instances(&self) -> BackendResult<Vec<RunningInstance>>;

    /// Recent output of the instance, for failure diagnostics.
    async fn logs(&self, instance: &RunningInstance) -> BackendResult<String>;

    /// Remove side artifacts owned by the instance (volumes, environments).
    async fn cleanup_side_effects(&self, instance: &RunningInstance) -> BackendResult<()>;

    async fn list_running(&self) -> BackendResult<Vec<RunningInstance>> {
        Ok(self
            .list_instances()
            .await?
            .into_iter()
            .filter(|i| i.running)
            .collect())
    }

    /// Instances `criteria` selects for `identity`, each exactly once.
    async fn find(
        &self,
        identity: &DeploymentIdentity,
        criteria: &MatchCriteria,
    ) -> BackendResult<Vec<RunningInstance>> {
        let instances = self.list_instances().await?;
        Ok(select(&instances, identity, criteria))
    }

    /// Stop every selected instance, and remove it too when `remove` is set.
    ///
    /// Keeps going past per-instance failures and reports them in the
    /// outcome, so callers always learn which instances did change state.
    /// Only a failed listing is returned as an error.
    async fn stop_matching(
        &self,
        identity: &DeploymentIdentity,
        criteria: &MatchCriteria,
        remove: bool,
    ) -> BackendResult<StopOutcome> {
        let mut outcome = StopOutcome::default();
        for instance in self.find(identity, criteria).await? {
            if instance.running {
                if let Err(e) = self.stop(&instance).await {
                    warn!(deployment = %instance.deployment_name, error = %e, "stop failed");
                    outcome.errors.push(format!("{}: {e}", instance.deployment_name));
                    continue;
                }
                outcome.stopped.push(instance.clone());
            }
            if remove {
                if let Err(e) = self.remove(&instance).await {
                    warn!(deployment = %instance.deployment_name, error = %e, "remove failed");
                    outcome.errors.push(format!("{}: {e}", instance.deployment_name));
                    continue;
                }
                outcome.removed.push(instance);
            }
        }
        Ok(outcome)
    }
}

/// What a dependent backend needs to register a promoted instance.
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    pub deployment_name: &'a str,
    pub labels: &'a InstanceLabels,
    /// Caller-supplied scheduled-job definition, if any.
    pub job: Option<&'a serde_json::Value>,
}

#[async_trait]
pub trait DependentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Register the entry for a freshly promoted instance, replacing an
    /// earlier entry of the same deployment name. Returns `false` when
    /// this backend has nothing to register for it.
    async fn register(&self, registration: Registration<'_>) -> BackendResult<bool>;

    /// Drop the entries that belong to `removed`. Returns the deployment
    /// names whose entries were dropped.
    async fn remove_for(&self, removed: &[RunningInstance]) -> BackendResult<Vec<String>>;

    async fn list_entries(&self) -> BackendResult<Vec<ModelSummary>>;
}
