//! Startup health-probe loop: polls a child's check endpoint until it
//! answers 2xx or the deadline elapses.

use std::time::{Duration, Instant};

use tracing::debug;

const PROBE_INTERVAL: Duration = Duration::from_millis(250);

pub enum ProbeOutcome {
    Healthy,
    TimedOut,
}

/// Polls `http://127.0.0.1:{port}{check_endpoint}` at a fixed short
/// interval until it returns a 2xx response or `timeout` elapses.
pub async fn probe_until_healthy(
    client: &reqwest::Client,
    port: u16,
    check_endpoint: &str,
    timeout: Duration,
) -> ProbeOutcome {
    let url = format!("http://127.0.0.1:{port}{check_endpoint}");
    let deadline = Instant::now() + timeout;

    loop {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return ProbeOutcome::Healthy,
            Ok(resp) => {
                debug!(url = %url, status = %resp.status(), "health probe not yet successful");
            }
            Err(e) => {
                debug!(url = %url, error = %e, "health probe failed");
            }
        }

        if Instant::now() >= deadline {
            return ProbeOutcome::TimedOut;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::get};

    async fn spawn_health_server(healthy_after: Option<Duration>) -> u16 {
        let start = Instant::now();
        let app = Router::new().route(
            "/health",
            get(move || {
                let start = start;
                let healthy_after = healthy_after;
                async move {
                    match healthy_after {
                        Some(d) if start.elapsed() < d => axum::http::StatusCode::SERVICE_UNAVAILABLE,
                        _ => axum::http::StatusCode::OK,
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn reports_healthy_once_endpoint_succeeds() {
        let port = spawn_health_server(None).await;
        let client = reqwest::Client::new();
        let outcome = probe_until_healthy(&client, port, "/health", Duration::from_secs(2)).await;
        assert!(matches!(outcome, ProbeOutcome::Healthy));
    }

    #[tokio::test]
    async fn times_out_when_endpoint_never_succeeds() {
        let client = reqwest::Client::new();
        // Nothing listening on this port.
        let outcome = probe_until_healthy(&client, 1, "/health", Duration::from_millis(300)).await;
        assert!(matches!(outcome, ProbeOutcome::TimedOut));
    }
}
