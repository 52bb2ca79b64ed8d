//! Jittered periodic tag reconciliation.
//!
//! Every driver on every node runs this loop, and they all start at about the
//! same time.  Each cycle therefore sleeps a fresh uniform draw from
//! `[0, interval)` before reconciling, so calls to the tagging API spread out
//! instead of arriving together.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics;
use crate::tags::Reconcile;

pub struct TagSyncScheduler {
    interval: Duration,
    reconciler: Arc<dyn Reconcile>,
    rng: StdRng,
}

impl TagSyncScheduler {
    pub fn new(interval: Duration, reconciler: Arc<dyn Reconcile>, rng: StdRng) -> Self {
        Self {
            interval,
            reconciler,
            rng,
        }
    }

    /// Seed the jitter source from the OS, once.
    pub fn with_os_rng(interval: Duration, reconciler: Arc<dyn Reconcile>) -> Self {
        Self::new(interval, reconciler, StdRng::from_os_rng())
    }

    /// Uniform draw from `[0, interval)` at millisecond resolution.
    pub fn next_delay(&mut self) -> Duration {
        let millis = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.random_range(0..millis))
    }

    /// Loop until `shutdown` is cancelled.  A failed pass is logged and the
    /// next cycle starts regardless.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let delay = self.next_delay();
            info!(
                delay_secs = delay.as_secs(),
                "Begin to sync the tags of cluster and disks after sleeping"
            );

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.reconciler.reconcile().await {
                Ok(report) => {
                    info!(?report, "tag sync pass succeeded");
                    if let Some(m) = metrics::metrics() {
                        m.tag_sync_passes.with_label_values(&["ok"]).inc();
                        m.tag_sync_disks_updated.inc_by(report.updated as u64);
                    }
                }
                Err(e) => {
                    error!(error = %e, "tag sync pass failed");
                    if let Some(m) = metrics::metrics() {
                        m.tag_sync_passes.with_label_values(&["error"]).inc();
                    }
                }
            }
        }
    }
}
