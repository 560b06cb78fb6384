//! Cross-backend fan-out: the running-models report, and propagation of
//! removed instances to the dependent backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use modelgrid_backends::{DependentBackend, Registration, RuntimeBackend};
use modelgrid_core::{BackendKind, ModelSummary, RunningInstance};
use tracing::{debug, warn};

/// Tell every dependent backend that `removed` is gone.
///
/// Best-effort: failures come back as warnings.
pub async fn propagate_removed(
    dependents: &[Arc<dyn DependentBackend>],
    removed: &[RunningInstance],
) -> Vec<String> {
    let mut warnings = Vec::new();
    if removed.is_empty() {
        return warnings;
    }
    for dependent in dependents {
        match dependent.remove_for(removed).await {
            Ok(dropped) => {
                debug!(backend = %dependent.kind(), ?dropped, "dependent entries removed")
            }
            Err(e) => {
                warn!(backend = %dependent.kind(), error = %e, "dependent cleanup failed");
                warnings.push(format!("{}: {e}", dependent.kind()));
            }
        }
    }
    warnings
}

/// Register a promoted instance with every dependent backend.
pub async fn register_promoted(
    dependents: &[Arc<dyn DependentBackend>],
    registration: Registration<'_>,
) -> Vec<String> {
    let mut warnings = Vec::new();
    for dependent in dependents {
        match dependent.register(registration).await {
            Ok(registered) => {
                debug!(backend = %dependent.kind(), registered, "dependent registration")
            }
            Err(e) => {
                warn!(backend = %dependent.kind(), error = %e, "dependent registration failed");
                warnings.push(format!("{}: {e}", dependent.kind()));
            }
        }
    }
    warnings
}

/// Read-only view across every configured backend.
#[derive(Clone, Default)]
pub struct Aggregator {
    runtimes: Vec<Arc<dyn RuntimeBackend>>,
    dependents: Vec<Arc<dyn DependentBackend>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(mut self, backend: Arc<dyn RuntimeBackend>) -> Self {
        self.runtimes.push(backend);
        self
    }

    pub fn with_dependent(mut self, backend: Arc<dyn DependentBackend>) -> Self {
        self.dependents.push(backend);
        self
    }

    pub fn dependents(&self) -> &[Arc<dyn DependentBackend>] {
        &self.dependents
    }

    /// Running models per backend. A backend that cannot be listed
    /// reports an empty list instead of failing the whole report.
    pub async fn list_running(&self) -> BTreeMap<BackendKind, Vec<ModelSummary>> {
        let mut report = BTreeMap::new();
        for backend in &self.runtimes {
            let models = match backend.list_running().await {
                Ok(instances) => instances.iter().map(ModelSummary::from).collect(),
                Err(e) => {
                    warn!(backend = %backend.kind(), error = %e, "listing failed, reporting none");
                    Vec::new()
                }
            };
            report.insert(backend.kind(), models);
        }
        for backend in &self.dependents {
            let models = backend.list_entries().await.unwrap_or_else(|e| {
                warn!(backend = %backend.kind(), error = %e, "listing failed, reporting none");
                Vec::new()
            });
            report.insert(backend.kind(), models);
        }
        report
    }
}
