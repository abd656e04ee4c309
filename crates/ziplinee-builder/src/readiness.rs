//! HTTP readiness probing for service containers.

use crate::error::{Error, Result};
use reqwest::header::HOST;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Polls `GET {scheme}://{host}:{port}{path}` until it returns 2xx or the
/// timeout expires. A non-empty `hostname` overrides the Host header so
/// virtual-hosted services can be probed through their cluster address.
pub async fn wait_for_readiness_http_get(
    scheme: &str,
    host: &str,
    port: u16,
    path: &str,
    hostname: &str,
    timeout_seconds: u64,
) -> Result<()> {
    let url = format!("{scheme}://{host}:{port}{path}");
    let deadline = Instant::now() + Duration::from_secs(timeout_seconds);

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()?;

    loop {
        let mut request = client.get(&url);
        if !hostname.is_empty() {
            request = request.header(HOST, hostname);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, status = %response.status(), "Readiness probe succeeded");
                return Ok(());
            }
            Ok(response) => {
                debug!(url, status = %response.status(), "Readiness probe not ready yet");
            }
            Err(err) => {
                debug!(url, error = %err, "Readiness probe connection failed");
            }
        }

        if Instant::now() >= deadline {
            warn!(url, timeout_seconds, "Readiness probe timed out");
            return Err(Error::ReadinessTimeout {
                service: host.to_string(),
                timeout_seconds,
            });
        }

        sleep(Duration::from_secs(1)).await;
    }
}
