//! The probing seam the coordinator depends on.

use std::time::Duration;

use async_trait::async_trait;
use modelgrid_core::config::{HealthConfig, PortCheckConfig, duration_or};
use tracing::info;

use crate::checker::{Backoff, probe_until_healthy};
use crate::port::port_in_use;

/// Liveness and port checks for instances on the local host.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Poll the liveness endpoint until healthy or out of retries.
    async fn is_healthy(&self, port: u16) -> bool;

    /// Whether something already listens on `port`.
    async fn port_in_use(&self, port: u16) -> bool;
}

/// HTTP/TCP prober driven by configuration.
#[derive(Debug, Clone)]
pub struct HttpProber {
    host: String,
    path: String,
    attempt_timeout: Duration,
    retries: u32,
    backoff: Backoff,
    port_retries: u32,
    port_interval: Duration,
}

impl HttpProber {
    pub fn new(health: &HealthConfig, port_check: &PortCheckConfig) -> Self {
        Self {
            host: health.host.clone(),
            path: health.path.clone(),
            attempt_timeout: duration_or(&health.timeout, Duration::from_secs(1)),
            retries: health.retries,
            backoff: Backoff::Exponential {
                base: duration_or(&health.backoff_base, Duration::from_millis(250)),
                max: duration_or(&health.backoff_max, Duration::from_secs(2)),
            },
            port_retries: port_check.retries,
            port_interval: duration_or(&port_check.interval, Duration::from_secs(1)),
        }
    }

    /// Replace the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Upper bound on the wall time of one `is_healthy` call.
    pub fn max_wait(&self) -> Duration {
        (self.attempt_timeout + self.backoff.ceiling()) * self.retries
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn is_healthy(&self, port: u16) -> bool {
        let address = format!("{}:{port}", self.host);
        let report = probe_until_healthy(
            &address,
            &self.path,
            self.attempt_timeout,
            self.retries,
            self.backoff,
        )
        .await;
        info!(
            %address,
            healthy = report.healthy,
            attempts = report.attempts,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "health probe finished"
        );
        report.healthy
    }

    async fn port_in_use(&self, port: u16) -> bool {
        port_in_use(&self.host, port, self.port_retries, self.port_interval).await
    }
}
