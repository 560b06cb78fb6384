//! modelgrid-health — liveness probing for freshly started model servers.
//!
//! Health failure is an expected outcome here, not an error: every probe
//! returns a plain `bool` after a bounded number of attempts, and the
//! coordinator branches on it.
//!
//! # Architecture
//!
//! ```text
//! Prober (trait, injected into the coordinator)
//!   └── HttpProber
//!       ├── probe_until_healthy() → ProbeReport
//!       │   ├── http_probe() → ProbeResult   (per attempt, short timeout)
//!       │   └── Backoff::delay(attempt)      (exponential, capped)
//!       └── port_in_use()                    (TCP connect, fixed interval)
//! ```
//!
//! Total wall time of a probe is bounded by
//! `retries * (attempt_timeout + backoff_max)`.

pub mod checker;
pub mod port;
pub mod prober;

pub use checker::{Backoff, ProbeReport, ProbeResult, http_probe, probe_until_healthy};
pub use port::port_in_use;
pub use prober::{HttpProber, Prober};
