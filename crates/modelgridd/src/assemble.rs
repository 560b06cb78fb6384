//! Wires the configured backends into coordinators and the API state.
//!
//! Both runtime backends (containers and sessions) share one prober, one
//! model repository and the same dependent backends, so a promotion on
//! either substrate keeps scheduled jobs and monitoring targets current.

use std::sync::Arc;

use modelgrid_api::{ApiState, Credentials};
use modelgrid_backends::{
    CommandRunner, ContainerBackend, ContainerSchedulerControl, DependentBackend, MonitoringBackend,
    RuntimeBackend, ScheduleBackend, SessionBackend, SystemCommandRunner,
};
use modelgrid_core::{CoordinatorConfig, FsModelRepository, ModelRepository};
use modelgrid_health::{HttpProber, Prober};
use modelgrid_rollout::{Aggregator, LifecycleCoordinator, RolloutPolicy};
use tracing::info;

/// Build the API state for `config`, running external commands with `runner`.
pub fn build_state(config: &CoordinatorConfig, runner: Arc<dyn CommandRunner>) -> ApiState {
    let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(&config.health, &config.port_check));
    let repository: Arc<dyn ModelRepository> =
        Arc::new(FsModelRepository::new(&config.repository.root));
    let policy = RolloutPolicy::from_config(config);

    // ── Dependent backends ─────────────────────────────────────
    let mut dependents: Vec<Arc<dyn DependentBackend>> = Vec::new();
    if let Some(schedule) = &config.schedule {
        let control = Arc::new(ContainerSchedulerControl::new(schedule, runner.clone()));
        dependents.push(Arc::new(ScheduleBackend::new(schedule.clone(), &config.prefix, control)));
        info!(job_dir = ?schedule.job_dir, "scheduled-job backend enabled");
    }
    if let Some(monitoring) = &config.monitoring {
        dependents.push(Arc::new(MonitoringBackend::new(monitoring.clone())));
        info!(targets_file = ?monitoring.targets_file, "monitoring backend enabled");
    }

    // ── Runtime backends ───────────────────────────────────────
    let runtimes: [Arc<dyn RuntimeBackend>; 2] = [
        Arc::new(ContainerBackend::new(
            config.container.clone(),
            &config.prefix,
            config.env_vars.clone(),
            runner.clone(),
        )),
        Arc::new(SessionBackend::new(
            config.session.clone(),
            &config.prefix,
            config.env_vars.clone(),
            runner,
        )),
    ];

    let mut aggregator = Aggregator::new();
    let mut coordinators = Vec::new();
    for backend in runtimes {
        aggregator = aggregator.with_runtime(backend.clone());
        let mut coordinator = LifecycleCoordinator::new(
            &config.prefix,
            backend,
            repository.clone(),
            prober.clone(),
            policy.clone(),
        );
        for dependent in &dependents {
            coordinator = coordinator.with_dependent(dependent.clone());
        }
        coordinators.push(Arc::new(coordinator));
    }
    for dependent in dependents {
        aggregator = aggregator.with_dependent(dependent);
    }

    let server = &config.server;
    let credentials =
        Credentials::from_pair(server.username.as_deref(), server.password.as_deref());
    if credentials.is_none() {
        info!("no credentials configured, /start and /stop are open");
    }

    coordinators
        .into_iter()
        .fold(ApiState::new(aggregator), ApiState::with_coordinator)
        .with_credentials(credentials)
}

/// Production wiring: external commands run on this host.
pub fn build_system_state(config: &CoordinatorConfig) -> ApiState {
    build_state(config, Arc::new(SystemCommandRunner))
}
