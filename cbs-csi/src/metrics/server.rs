//! Self-restarting `/metrics` HTTP endpoint.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::gather_text;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Keeps a metrics listener up for the life of the process.
///
/// A bind or serve failure is logged and retried after the retry delay; it
/// never reaches the caller.
pub struct MetricsSupervisor {
    addr: SocketAddr,
    retry_delay: Duration,
    attempts: Arc<AtomicU64>,
}

impl MetricsSupervisor {
    /// Listen on every interface at `port`.
    pub fn new(port: u16) -> Self {
        Self::with_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            retry_delay: DEFAULT_RETRY_DELAY,
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Number of bind attempts made so far.
    pub fn attempts(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.attempts)
    }

    pub fn router() -> Router {
        Router::new().route("/metrics", get(render_metrics))
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            self.attempts.fetch_add(1, Ordering::Relaxed);

            match TcpListener::bind(self.addr).await {
                Ok(listener) => {
                    info!(addr = %self.addr, "metrics server listening");
                    let token = shutdown.clone();
                    let served = axum::serve(listener, Self::router())
                        .with_graceful_shutdown(async move { token.cancelled().await })
                        .await;
                    match served {
                        Ok(()) => warn!(addr = %self.addr, "metrics server exited"),
                        Err(e) => error!(addr = %self.addr, error = %e, "metrics server failed"),
                    }
                }
                Err(e) => error!(addr = %self.addr, error = %e, "failed to bind metrics server"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

async fn render_metrics() -> Response {
    match gather_text() {
        Ok(body) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::register_metrics;

    async fn wait_for(attempts: &AtomicU64, at_least: u64) {
        while attempts.load(Ordering::Relaxed) < at_least {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn retries_until_port_frees_then_serves() {
        register_metrics().unwrap();

        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();

        let delay = Duration::from_millis(20);
        let supervisor = MetricsSupervisor::with_addr(addr).with_retry_delay(delay);
        let attempts = supervisor.attempts();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), wait_for(&attempts, 2))
            .await
            .expect("supervisor kept retrying");
        drop(blocker);

        let url = format!("http://{addr}/metrics");
        let body = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match reqwest::get(&url).await {
                    Ok(resp) if resp.status().is_success() => return resp.text().await.unwrap(),
                    _ => {}
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("metrics endpoint came up");
        assert!(body.contains("tag_sync_disks_updated_total"));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_supervisor_returns() {
        let supervisor = MetricsSupervisor::with_addr("127.0.0.1:0".parse().unwrap());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), supervisor.run(shutdown))
            .await
            .unwrap();
    }
}
