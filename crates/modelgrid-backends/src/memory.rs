//! In-memory runtime backend.
//!
//! Keeps instances in a map instead of a real substrate and doubles as the
//! [`Prober`] for them: an instance is healthy on its port unless a fault
//! was injected for its version. Used by the coordinator and API test
//! suites, and for dry runs.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use modelgrid_core::{BackendKind, BundleRef, DeploymentIdentity, InstanceLabels, RunningInstance};
use modelgrid_health::Prober;
use tracing::debug;

use crate::backend::RuntimeBackend;
use crate::error::{BackendError, BackendResult};

#[derive(Debug, Clone)]
struct Slot {
    instance: RunningInstance,
    healthy: bool,
}

#[derive(Debug, Default)]
struct State {
    slots: Vec<Slot>,
    /// Deployment names with a prepared image/environment.
    prepared: BTreeSet<String>,
    /// Deployment names with side artifacts (volumes).
    side_effects: BTreeSet<String>,
    next_handle: u64,
    unhealthy_versions: HashSet<String>,
    build_failures: HashSet<String>,
    run_failures: HashSet<String>,
    occupied_ports: HashSet<u16>,
    fail_restarts: bool,
    fail_stops: bool,
    fail_listing: bool,
}

pub struct MemoryBackend {
    kind: BackendKind,
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            state: Mutex::new(State::default()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Instances of `version` start but never pass a health probe.
    pub fn inject_unhealthy(&self, version: &str) {
        self.with(|s| s.unhealthy_versions.insert(version.to_string()));
    }

    pub fn inject_build_failure(&self, version: &str) {
        self.with(|s| s.build_failures.insert(version.to_string()));
    }

    /// Instances of `version` are created but exit immediately.
    pub fn inject_run_failure(&self, version: &str) {
        self.with(|s| s.run_failures.insert(version.to_string()));
    }

    /// Something outside our control listens on `port`.
    pub fn occupy_port(&self, port: u16) {
        self.with(|s| s.occupied_ports.insert(port));
    }

    pub fn fail_restarts(&self, fail: bool) {
        self.with(|s| s.fail_restarts = fail);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.with(|s| s.fail_stops = fail);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.with(|s| s.fail_listing = fail);
    }

    /// Snapshot of every instance, stopped ones included.
    pub fn instances(&self) -> Vec<RunningInstance> {
        self.with(|s| s.slots.iter().map(|slot| slot.instance.clone()).collect())
    }

    pub fn running(&self) -> Vec<RunningInstance> {
        self.with(|s| {
            s.slots
                .iter()
                .filter(|slot| slot.instance.running)
                .map(|slot| slot.instance.clone())
                .collect()
        })
    }

    pub fn prepared(&self) -> BTreeSet<String> {
        self.with(|s| s.prepared.clone())
    }

    pub fn side_effects(&self) -> BTreeSet<String> {
        self.with(|s| s.side_effects.clone())
    }

    /// Seed an instance as if an earlier coordinator run had started it.
    pub fn seed(
        &self,
        identity: &DeploymentIdentity,
        labels: &InstanceLabels,
        running: bool,
    ) -> RunningInstance {
        self.with(|s| {
            let instance = new_instance(s, self.kind, identity, labels, running);
            s.prepared.insert(instance.deployment_name.clone());
            s.side_effects.insert(instance.deployment_name.clone());
            s.slots.push(Slot {
                instance: instance.clone(),
                healthy: true,
            });
            instance
        })
    }

    fn find_mut<'a>(state: &'a mut State, handle: &str) -> BackendResult<&'a mut Slot> {
        state
            .slots
            .iter_mut()
            .find(|slot| slot.instance.handle == handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))
    }
}

fn new_instance(
    state: &mut State,
    kind: BackendKind,
    identity: &DeploymentIdentity,
    labels: &InstanceLabels,
    running: bool,
) -> RunningInstance {
    state.next_handle += 1;
    RunningInstance {
        backend: kind,
        handle: format!("mem-{}", state.next_handle),
        deployment_name: identity.deployment_name(),
        labels: labels.clone(),
        running,
    }
}

#[async_trait]
impl RuntimeBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn prepare(
        &self,
        identity: &DeploymentIdentity,
        bundle: &BundleRef,
    ) -> BackendResult<()> {
        self.with(|s| {
            if s.build_failures.contains(&bundle.version) {
                let msg = format!("{}: injected build failure", bundle.version);
                return Err(BackendError::Build(msg));
            }
            s.prepared.insert(identity.deployment_name());
            Ok(())
        })
    }

    async fn discard_prepared(&self, identity: &DeploymentIdentity) -> BackendResult<()> {
        self.with(|s| s.prepared.remove(&identity.deployment_name()));
        Ok(())
    }

    async fn start(
        &self,
        identity: &DeploymentIdentity,
        _bundle: &BundleRef,
        labels: &InstanceLabels,
    ) -> BackendResult<RunningInstance> {
        self.with(|s| {
            let exits = s.run_failures.contains(&labels.version);
            let instance = new_instance(s, self.kind, identity, labels, !exits);
            s.side_effects.insert(instance.deployment_name.clone());
            let healthy = !s.unhealthy_versions.contains(&labels.version);
            s.slots.push(Slot {
                instance: instance.clone(),
                healthy,
            });
            if exits {
                let msg = format!("{}: exited with code 1", instance.deployment_name);
                return Err(BackendError::Run(msg));
            }
            debug!(deployment = %instance.deployment_name, "memory instance started");
            Ok(instance)
        })
    }

    async fn restart(&self, instance: &RunningInstance) -> BackendResult<()> {
        self.with(|s| {
            if s.fail_restarts {
                let msg = format!("{}: injected restart failure", instance.deployment_name);
                return Err(BackendError::Run(msg));
            }
            Self::find_mut(s, &instance.handle)?.instance.running = true;
            Ok(())
        })
    }

    async fn stop(&self, instance: &RunningInstance) -> BackendResult<()> {
        self.with(|s| {
            if s.fail_stops {
                return Err(BackendError::Command {
                    program: "memory".into(),
                    status: Some(1),
                    stderr: "injected stop failure".into(),
                });
            }
            Self::find_mut(s, &instance.handle)?.instance.running = false;
            Ok(())
        })
    }

    async fn remove(&self, instance: &RunningInstance) -> BackendResult<()> {
        self.with(|s| {
            let before = s.slots.len();
            s.slots.retain(|slot| slot.instance.handle != instance.handle);
            if s.slots.len() == before {
                return Err(BackendError::NotFound(instance.handle.clone()));
            }
            s.prepared.remove(&instance.deployment_name);
            Ok(())
        })
    }

    async fn list_instances(&self) -> BackendResult<Vec<RunningInstance>> {
        if self.with(|s| s.fail_listing) {
            return Err(BackendError::Command {
                program: "memory".into(),
                status: Some(1),
                stderr: "injected listing failure".into(),
            });
        }
        Ok(self.instances())
    }

    async fn logs(&self, instance: &RunningInstance) -> BackendResult<String> {
        self.with(|s| {
            let slot = Self::find_mut(s, &instance.handle)?;
            Ok(if slot.healthy {
                format!("{}: serving on port {}\n", instance.deployment_name, slot.instance.port())
            } else {
                format!("{}: Traceback: model failed to load\n", instance.deployment_name)
            })
        })
    }

    async fn cleanup_side_effects(&self, instance: &RunningInstance) -> BackendResult<()> {
        self.with(|s| s.side_effects.remove(&instance.deployment_name));
        Ok(())
    }
}

#[async_trait]
impl Prober for MemoryBackend {
    async fn is_healthy(&self, port: u16) -> bool {
        self.with(|s| {
            s.slots
                .iter()
                .any(|slot| slot.instance.running && slot.healthy && slot.instance.port() == port)
        })
    }

    async fn port_in_use(&self, port: u16) -> bool {
        self.with(|s| {
            s.occupied_ports.contains(&port)
                || s.slots
                    .iter()
                    .any(|slot| slot.instance.running && slot.instance.port() == port)
        })
    }
}
