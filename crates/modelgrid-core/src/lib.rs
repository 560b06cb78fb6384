//! modelgrid-core — shared vocabulary for the ModelGrid coordinator.
//!
//! Everything that the coordinator, the backends, and the HTTP layer agree
//! on lives here: deployment identity and naming, the label set that marks
//! a running instance, the stale-instance match predicate, the model
//! repository read interface, and the `modelgrid.toml` configuration.

pub mod config;
pub mod error;
pub mod identity;
pub mod matching;
pub mod repository;
pub mod types;

pub use config::CoordinatorConfig;
pub use error::{CoreError, CoreResult};
pub use identity::DeploymentIdentity;
pub use matching::{MatchBy, MatchCriteria, StageScope};
pub use repository::{
    BundleRef, DependencyManifest, FsModelRepository, ModelRepository, RepositoryError,
};
pub use types::*;
