//! modelgrid-api — thin HTTP layer over the lifecycle coordinator.
//!
//! Each workflow runs on its own task. Deploys are serialized per (model,
//! stage); an undeploy waits for every workflow of its model.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/start` | Deploy a model version into a stage (basic auth) |
//! | POST | `/stop` | Remove every instance of a model version (basic auth) |
//! | GET | `/running` | Running models per backend |
//! | GET | `/healthz` | Liveness of the coordinator itself |

pub mod auth;
pub mod handlers;
pub mod locks;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use modelgrid_core::BackendKind;
use modelgrid_rollout::{Aggregator, LifecycleCoordinator};

pub use auth::Credentials;
pub use locks::{KeyedLocks, SlotGuard};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    coordinators: Arc<BTreeMap<BackendKind, Arc<LifecycleCoordinator>>>,
    pub aggregator: Arc<Aggregator>,
    pub credentials: Option<Credentials>,
    pub locks: KeyedLocks,
}

impl ApiState {
    pub fn new(aggregator: Aggregator) -> Self {
        Self {
            coordinators: Arc::new(BTreeMap::new()),
            aggregator: Arc::new(aggregator),
            credentials: None,
            locks: KeyedLocks::default(),
        }
    }

    /// Route requests for the coordinator's backend kind to it.
    pub fn with_coordinator(mut self, coordinator: Arc<LifecycleCoordinator>) -> Self {
        Arc::make_mut(&mut self.coordinators).insert(coordinator.backend_kind(), coordinator);
        self
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn coordinator(&self, kind: BackendKind) -> Option<Arc<LifecycleCoordinator>> {
        self.coordinators.get(&kind).cloned()
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let guarded = Router::new()
        .route("/start", post(handlers::start))
        .route("/stop", post(handlers::stop))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_basic_auth))
        .with_state(state.clone());

    Router::new()
        .route("/running", get(handlers::running))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
        .merge(guarded)
}
