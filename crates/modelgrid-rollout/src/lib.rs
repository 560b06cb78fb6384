//! modelgrid-rollout — the deploy state machine and its compensating
//! rollback.
//!
//! This crate provides the lifecycle state machine that moves a model
//! deployment from one running instance set to the next on any
//! [`RuntimeBackend`](modelgrid_backends::RuntimeBackend), and the
//! aggregator that keeps dependent backends (scheduled jobs, monitoring
//! targets) in lockstep with it.
//!
//! # Components
//!
//! - **`controller`** — Lifecycle coordinator (deploy, undeploy, rollback)
//! - **`policy`** — Which instances each step stops or removes
//! - **`aggregator`** — Cross-backend listing and removal propagation
//! - **`request`** — Workflow inputs and reports
//! - **`error`** — Failure taxonomy

pub mod aggregator;
pub mod controller;
pub mod error;
pub mod policy;
pub mod request;

pub use aggregator::Aggregator;
pub use controller::{LifecycleCoordinator, LifecyclePhase};
pub use error::{DeployError, DeployResult};
pub use policy::RolloutPolicy;
pub use request::{DeployReport, DeployRequest, UndeployReport, UndeployRequest};
