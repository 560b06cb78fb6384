//! Health check probe logic.
//!
//! Performs HTTP liveness checks against a model server with a short
//! per-attempt timeout and a bounded, capped exponential backoff between
//! attempts.

use std::time::{Duration, Instant};

use tracing::debug;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 200.
    Healthy,
    /// The health endpoint answered with anything other than 200.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

/// Wait strategy between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same interval after every attempt.
    Fixed(Duration),
    /// `base * 2^attempt`, never above `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// Largest delay this strategy can produce.
    pub fn ceiling(&self) -> Duration {
        match *self {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { max, .. } => max,
        }
    }
}

/// Outcome of a full probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub healthy: bool,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Probe `address` + `path` up to `retries` times.
///
/// Never fails: exhausting the retries yields `healthy == false`.
pub async fn probe_until_healthy(
    address: &str,
    path: &str,
    attempt_timeout: Duration,
    retries: u32,
    backoff: Backoff,
) -> ProbeReport {
    let started = Instant::now();
    let retries = retries.max(1);

    for attempt in 0..retries {
        let result = http_probe(address, path, attempt_timeout).await;
        if result == ProbeResult::Healthy {
            debug!(%address, attempts = attempt + 1, "service up and running");
            return ProbeReport {
                healthy: true,
                attempts: attempt + 1,
                elapsed: started.elapsed(),
            };
        }
        if attempt + 1 < retries {
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    }

    debug!(%address, attempts = retries, "health check unsuccessful");
    ProbeReport {
        healthy: false,
        attempts: retries,
        elapsed: started.elapsed(),
    }
}

/// Perform one HTTP health probe against an endpoint.
///
/// Returns `Healthy` only for a 200 response, `Unhealthy` for any other
/// status, or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "health connection closed with error");
            }
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "modelgrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status() == http::StatusCode::OK => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-200");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
