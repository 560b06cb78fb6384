//! Lifecycle coordinator: drives one deploy or undeploy through the
//! rollout state machine.
//!
//! ```text
//! IDLE → PROVISIONING → STOPPING_OLD → PORT_CHECK → STARTING_NEW → HEALTH_CHECK
//!                                                        ├─ FINALIZING → DONE
//!                                                        └─ ROLLING_BACK → FAILED
//! ```
//!
//! Old instances are only stopped, never removed, until the new one has
//! passed its health gate. Every failure after the stop step restarts
//! what was stopped before the error is returned.

use std::sync::Arc;

use modelgrid_backends::{BackendError, DependentBackend, Registration, RuntimeBackend};
use modelgrid_core::{
    BackendKind, BundleRef, DeploymentIdentity, MatchCriteria, ModelRepository, RunningInstance,
};
use modelgrid_health::Prober;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::aggregator::{propagate_removed, register_promoted};
use crate::error::{DeployError, DeployResult};
use crate::policy::RolloutPolicy;
use crate::request::{DeployReport, DeployRequest, UndeployReport, UndeployRequest};

/// Current phase of a lifecycle workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Idle,
    /// Fetching the bundle and building the image or environment.
    Provisioning,
    /// Stopping (deploy) or removing (undeploy) matched instances.
    StoppingOld,
    PortCheck,
    StartingNew,
    HealthCheck,
    /// Removing superseded instances and their side effects.
    Finalizing,
    /// Removing the failed instance and restarting the stopped ones.
    RollingBack,
    Done,
    Failed,
}

impl LifecyclePhase {
    /// Whether the state machine may move from `self` to `next`.
    pub fn allows(self, next: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        matches!(
            (self, next),
            (Idle, Provisioning | StoppingOld | Failed)
                | (Provisioning, StoppingOld | Failed)
                | (StoppingOld, PortCheck | Finalizing | RollingBack | Failed)
                | (PortCheck, StartingNew | RollingBack)
                | (StartingNew, HealthCheck | RollingBack)
                | (HealthCheck, Finalizing | RollingBack)
                | (Finalizing, Done)
                | (RollingBack, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecyclePhase::Done | LifecyclePhase::Failed)
    }
}

/// Phase bookkeeping for one workflow run.
#[derive(Debug)]
struct Workflow {
    deployment: String,
    phase: LifecyclePhase,
    trace: Vec<LifecyclePhase>,
    warnings: Vec<String>,
}

impl Workflow {
    fn new(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            phase: LifecyclePhase::Idle,
            trace: vec![LifecyclePhase::Idle],
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, next: LifecyclePhase) {
        debug_assert!(self.phase.allows(next), "{:?} -> {:?}", self.phase, next);
        debug!(deployment = %self.deployment, from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
        self.trace.push(next);
    }

    /// Terminal failure: log and hand the error back.
    fn fail(&mut self, err: DeployError) -> DeployError {
        if self.phase != LifecyclePhase::Failed {
            self.enter(LifecyclePhase::Failed);
        }
        error!(deployment = %self.deployment, error = %err, "workflow failed");
        err
    }

    fn warn(&mut self, message: String) {
        warn!(deployment = %self.deployment, %message, "best-effort step failed");
        self.warnings.push(message);
    }
}

/// Coordinates deploys and undeploys on one runtime backend.
pub struct LifecycleCoordinator {
    prefix: String,
    backend: Arc<dyn RuntimeBackend>,
    repository: Arc<dyn ModelRepository>,
    prober: Arc<dyn Prober>,
    dependents: Vec<Arc<dyn DependentBackend>>,
    policy: RolloutPolicy,
}

impl LifecycleCoordinator {
    pub fn new(
        prefix: impl Into<String>,
        backend: Arc<dyn RuntimeBackend>,
        repository: Arc<dyn ModelRepository>,
        prober: Arc<dyn Prober>,
        policy: RolloutPolicy,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            backend,
            repository,
            prober,
            dependents: Vec::new(),
            policy,
        }
    }

    /// Keep `dependent` in lockstep with this backend's instances.
    pub fn with_dependent(mut self, dependent: Arc<dyn DependentBackend>) -> Self {
        self.dependents.push(dependent);
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Resolve the identity a request refers to.
    pub fn identity(
        &self,
        name: &str,
        raw_stage: &str,
        version: &str,
        suffix: Option<&str>,
    ) -> DeployResult<DeploymentIdentity> {
        let identity =
            DeploymentIdentity::parse(&self.prefix, name, raw_stage, Some(version), suffix)?;
        identity.require_version()?;
        Ok(identity)
    }

    /// Deploy a new instance, superseding the previous ones of its stage.
    pub async fn deploy(&self, request: &DeployRequest) -> DeployResult<DeployReport> {
        let identity = self.identity(
            &request.name,
            &request.stage,
            &request.version,
            request.suffix.as_deref(),
        )?;
        let deployment_name = identity.deployment_name();
        let labels = identity.labels(&request.args, request.batch_prediction);
        let port = request.args.port;
        let mut wf = Workflow::new(&deployment_name);

        info!(
            deployment = %deployment_name,
            backend = %self.backend.kind(),
            model = %identity.name,
            version = %request.version,
            stage = %identity.stage,
            port,
            "deploy started"
        );

        // PROVISIONING
        wf.enter(LifecyclePhase::Provisioning);
        let bundle = match self.fetch(&identity.name, &request.version).await {
            Ok(bundle) => bundle,
            Err(e) => return Err(wf.fail(e)),
        };
        if let Err(e) = self.backend.prepare(&identity, &bundle).await {
            let err = self.preparation_error(e);
            self.discard_prepared(&mut wf, &identity).await;
            return Err(wf.fail(err));
        }

        // STOPPING_OLD
        wf.enter(LifecyclePhase::StoppingOld);
        let stopped = match self
            .backend
            .stop_matching(&identity, &self.policy.pre_stop_criteria(), false)
            .await
        {
            Ok(outcome) if outcome.is_clean() => outcome.stopped,
            Ok(outcome) => {
                let err = DeployError::StopFailed { errors: outcome.errors };
                return Err(self.roll_back(&mut wf, &identity, None, &outcome.stopped, err).await);
            }
            Err(e) => {
                self.discard_prepared(&mut wf, &identity).await;
                return Err(wf.fail(e.into()));
            }
        };
        debug!(
            deployment = %deployment_name,
            stopped = stopped.len(),
            "previous instances stopped"
        );

        // PORT_CHECK
        wf.enter(LifecyclePhase::PortCheck);
        if self.prober.port_in_use(port).await {
            let err = DeployError::PortInUse { port };
            return Err(self.roll_back(&mut wf, &identity, None, &stopped, err).await);
        }

        // STARTING_NEW
        wf.enter(LifecyclePhase::StartingNew);
        let instance = match self.backend.start(&identity, &bundle, &labels).await {
            Ok(instance) => instance,
            Err(e) => {
                let err = DeployError::RunFailure {
                    deployment_name: deployment_name.clone(),
                    reason: e.to_string(),
                    logs: None,
                };
                return Err(self.roll_back(&mut wf, &identity, None, &stopped, err).await);
            }
        };

        // HEALTH_CHECK
        wf.enter(LifecyclePhase::HealthCheck);
        if !self.prober.is_healthy(port).await {
            let err = DeployError::HealthCheckFailed {
                deployment_name: deployment_name.clone(),
                logs: None,
            };
            return Err(self
                .roll_back(&mut wf, &identity, Some(&instance), &stopped, err)
                .await);
        }
        info!(deployment = %deployment_name, port, "new instance healthy");

        // FINALIZING
        wf.enter(LifecyclePhase::Finalizing);
        let removed = self
            .remove_matching(&mut wf, &identity, &self.policy.supersede_criteria(&deployment_name))
            .await;
        let warnings = propagate_removed(&self.dependents, &removed).await;
        wf.warnings.extend(warnings);
        let warnings = register_promoted(
            &self.dependents,
            Registration {
                deployment_name: &deployment_name,
                labels: &labels,
                job: request.job.as_ref(),
            },
        )
        .await;
        wf.warnings.extend(warnings);

        wf.enter(LifecyclePhase::Done);
        let removed: Vec<String> = removed.into_iter().map(|i| i.deployment_name).collect();
        info!(
            deployment = %deployment_name,
            ?removed,
            warnings = wf.warnings.len(),
            "deploy finished"
        );
        Ok(DeployReport {
            deployment_name,
            port,
            removed,
            warnings: wf.warnings,
            phases: wf.trace,
        })
    }

    /// Remove every instance of `name:version`, in any stage.
    pub async fn undeploy(&self, request: &UndeployRequest) -> DeployResult<UndeployReport> {
        let identity = self.identity(&request.name, &request.stage, &request.version, None)?;
        let mut wf = Workflow::new(identity.slot_name());
        info!(
            backend = %self.backend.kind(),
            model = %identity.name,
            version = %request.version,
            "undeploy started"
        );

        wf.enter(LifecyclePhase::StoppingOld);
        let outcome = match self
            .backend
            .stop_matching(&identity, &self.policy.undeploy_criteria(), true)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return Err(wf.fail(e.into())),
        };
        if outcome.removed.is_empty() {
            let err = if outcome.errors.is_empty() {
                DeployError::NotFound {
                    name: request.name.clone(),
                    version: request.version.clone(),
                }
            } else {
                DeployError::StopFailed { errors: outcome.errors }
            };
            return Err(wf.fail(err));
        }
        for e in outcome.errors {
            wf.warn(e);
        }

        wf.enter(LifecyclePhase::Finalizing);
        for instance in &outcome.removed {
            if let Err(e) = self.backend.cleanup_side_effects(instance).await {
                wf.warn(format!("{}: side-effect cleanup: {e}", instance.deployment_name));
            }
        }
        // Scheduled jobs go only when the caller asks for it.
        let dependents: Vec<Arc<dyn DependentBackend>> = self
            .dependents
            .iter()
            .filter(|d| request.batch_prediction || d.kind() != BackendKind::Schedule)
            .cloned()
            .collect();
        let warnings = propagate_removed(&dependents, &outcome.removed).await;
        wf.warnings.extend(warnings);

        wf.enter(LifecyclePhase::Done);
        let removed: Vec<String> = outcome.removed.into_iter().map(|i| i.deployment_name).collect();
        info!(?removed, "undeploy finished");
        Ok(UndeployReport {
            removed,
            warnings: wf.warnings,
            phases: wf.trace,
        })
    }

    async fn fetch(&self, name: &str, version: &str) -> DeployResult<BundleRef> {
        let after = self.policy.fetch_timeout;
        match tokio::time::timeout(after, self.repository.fetch(name, version)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeployError::Timeout {
                step: "model fetch",
                after,
            }),
        }
    }

    fn preparation_error(&self, e: BackendError) -> DeployError {
        match e {
            BackendError::Build(msg) => DeployError::BuildFailure(msg),
            BackendError::Provision(msg) => DeployError::ProvisionFailure(msg),
            other if self.backend.kind() == BackendKind::Session => {
                DeployError::ProvisionFailure(other.to_string())
            }
            other => DeployError::BuildFailure(other.to_string()),
        }
    }

    async fn discard_prepared(&self, wf: &mut Workflow, identity: &DeploymentIdentity) {
        if let Err(e) = self.backend.discard_prepared(identity).await {
            wf.warn(format!("discarding prepared artifacts: {e}"));
        }
    }

    /// Stop and remove the selected instances, then clean their side
    /// effects. Failures become warnings: the new instance is already live.
    async fn remove_matching(
        &self,
        wf: &mut Workflow,
        identity: &DeploymentIdentity,
        criteria: &MatchCriteria,
    ) -> Vec<RunningInstance> {
        let outcome = match self.backend.stop_matching(identity, criteria, true).await {
            Ok(outcome) => outcome,
            Err(e) => {
                wf.warn(format!("listing superseded instances: {e}"));
                return Vec::new();
            }
        };
        for e in outcome.errors {
            wf.warn(e);
        }
        for instance in &outcome.removed {
            if let Err(e) = self.backend.cleanup_side_effects(instance).await {
                wf.warn(format!("{}: side-effect cleanup: {e}", instance.deployment_name));
            }
        }
        outcome.removed
    }

    /// Compensate a failed attempt: capture the new instance's logs, remove
    /// everything the attempt created, restart what it stopped.
    ///
    /// `started` is the new instance when `start` returned one. Without it,
    /// any instance carrying the attempt's deployment name is treated as a
    /// leftover of a failed start.
    async fn roll_back(
        &self,
        wf: &mut Workflow,
        identity: &DeploymentIdentity,
        started: Option<&RunningInstance>,
        stopped: &[RunningInstance],
        cause: DeployError,
    ) -> DeployError {
        wf.enter(LifecyclePhase::RollingBack);
        warn!(deployment = %wf.deployment, cause = %cause, stopped = stopped.len(), "rolling back");

        let leftovers = match started {
            Some(instance) => vec![instance.clone()],
            None => self
                .backend
                .find(identity, &MatchCriteria::by_name(identity.deployment_name()))
                .await
                .unwrap_or_else(|e| {
                    wf.warn(format!("listing leftovers: {e}"));
                    Vec::new()
                }),
        };

        let mut logs = None;
        let mut restore_errors = Vec::new();
        for instance in &leftovers {
            match self.backend.logs(instance).await {
                Ok(tail) => logs = Some(tail),
                Err(e) => wf.warn(format!("{}: capturing logs: {e}", instance.deployment_name)),
            }
            if let Err(e) = self.backend.remove(instance).await {
                restore_errors.push(format!(
                    "{}: failed instance not removed: {e}",
                    instance.deployment_name
                ));
            }
            if let Err(e) = self.backend.cleanup_side_effects(instance).await {
                wf.warn(format!("{}: side-effect cleanup: {e}", instance.deployment_name));
            }
        }
        self.discard_prepared(wf, identity).await;

        for instance in stopped {
            if let Err(e) = self.backend.restart(instance).await {
                restore_errors.push(format!("{}: restart failed: {e}", instance.deployment_name));
                continue;
            }
            if !self.prober.is_healthy(instance.port()).await {
                restore_errors.push(format!(
                    "{}: not healthy after restart on port {}",
                    instance.deployment_name,
                    instance.port()
                ));
                continue;
            }
            info!(deployment = %instance.deployment_name, "previous instance restored");
        }

        let cause = with_logs(cause, logs);
        let err = if restore_errors.is_empty() {
            cause
        } else {
            DeployError::RestoreFailed {
                cause: Box::new(cause),
                restore_errors,
            }
        };
        wf.fail(err)
    }
}

fn with_logs(err: DeployError, captured: Option<String>) -> DeployError {
    match err {
        DeployError::RunFailure {
            deployment_name,
            reason,
            logs,
        } => DeployError::RunFailure {
            deployment_name,
            reason,
            logs: logs.or(captured),
        },
        DeployError::HealthCheckFailed { deployment_name, logs } => DeployError::HealthCheckFailed {
            deployment_name,
            logs: logs.or(captured),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_allowed() {
        use LifecyclePhase::*;
        let path = [
            Idle,
            Provisioning,
            StoppingOld,
            PortCheck,
            StartingNew,
            HealthCheck,
            Finalizing,
            Done,
        ];
        assert!(path.windows(2).all(|w| w[0].allows(w[1])));
        assert!(Done.is_terminal());
    }

    #[test]
    fn rollback_is_reachable_only_after_stopping() {
        use LifecyclePhase::*;
        assert!(!Provisioning.allows(RollingBack));
        assert!(PortCheck.allows(RollingBack));
        assert!(HealthCheck.allows(RollingBack));
        assert!(!Finalizing.allows(RollingBack));
        assert!(!Done.allows(Failed));
    }

    #[test]
    fn captured_logs_fill_health_failures() {
        let err = with_logs(
            DeployError::HealthCheckFailed {
                deployment_name: "x".into(),
                logs: None,
            },
            Some("boom".into()),
        );
        assert_eq!(err.logs(), Some("boom"));
    }
}
