//! modelgrid-backends — the execution substrates a model can be deployed on.
//!
//! Runtime backends host serving instances and implement
//! [`RuntimeBackend`]:
//!
//! * [`ContainerBackend`]: one docker container per instance.
//! * [`SessionBackend`]: one tmux session per instance, in a private conda
//!   environment.
//!
//! Dependent backends mirror promoted instances into other systems and
//! implement [`DependentBackend`]:
//!
//! * [`ScheduleBackend`]: scheduled batch jobs for a workflow scheduler.
//! * [`MonitoringBackend`]: scrape targets for a metrics collector.
//!
//! Backends never decide which instances a deployment affects; that is
//! [`modelgrid_core::matching::select`], applied by
//! [`RuntimeBackend::stop_matching`].

pub mod backend;
pub mod command;
pub mod container;
pub mod error;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod monitoring;
pub mod schedule;
pub mod session;

pub use backend::{DependentBackend, Registration, RuntimeBackend, StopOutcome};
pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use container::ContainerBackend;
pub use error::{BackendError, BackendResult};
#[cfg(any(test, feature = "memory"))]
pub use memory::MemoryBackend;
pub use monitoring::MonitoringBackend;
pub use schedule::{ContainerSchedulerControl, JobDeletion, ScheduleBackend, SchedulerControl};
pub use session::SessionBackend;
