//! Process-wide Prometheus metrics.
//!
//! One [`Registry`] per process.  [`register_metrics`] installs the driver's
//! collectors into it on first call and hands back the same handles on every
//! later call; the HTTP side lives in [`server`].

pub mod server;

use std::sync::{LazyLock, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use libcsi::CsiMessage;
use libcsi::transport::{CallResult, Interceptor, Next};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

pub use server::MetricsSupervisor;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static METRICS: OnceLock<Metrics> = OnceLock::new();
static REGISTER_LOCK: Mutex<()> = Mutex::new(());

/// Driver collectors.
#[derive(Clone)]
pub struct Metrics {
    pub operations: IntCounterVec,
    pub operation_duration: HistogramVec,
    pub tag_sync_passes: IntCounterVec,
    pub tag_sync_disks_updated: IntCounter,
}

impl Metrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let operations = IntCounterVec::new(
            Opts::new(
                "csi_operations_total",
                "CSI calls handled, by method and status code",
            ),
            &["method", "code"],
        )?;
        let operation_duration = HistogramVec::new(
            HistogramOpts::new("csi_operation_duration_seconds", "CSI call latency"),
            &["method"],
        )?;
        let tag_sync_passes = IntCounterVec::new(
            Opts::new(
                "tag_sync_passes_total",
                "Tag reconciliation passes, by result",
            ),
            &["result"],
        )?;
        let tag_sync_disks_updated = IntCounter::new(
            "tag_sync_disks_updated_total",
            "Disks whose cluster tag was written",
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(tag_sync_passes.clone()))?;
        registry.register(Box::new(tag_sync_disks_updated.clone()))?;
        #[cfg(target_os = "linux")]
        {
            let process = prometheus::process_collector::ProcessCollector::for_self();
            registry.register(Box::new(process))?;
        }

        Ok(Self {
            operations,
            operation_duration,
            tag_sync_passes,
            tag_sync_disks_updated,
        })
    }
}

/// Register the driver's collectors with [`REGISTRY`].  Idempotent.
pub fn register_metrics() -> prometheus::Result<&'static Metrics> {
    if let Some(m) = METRICS.get() {
        return Ok(m);
    }
    let _guard = REGISTER_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(m) = METRICS.get() {
        return Ok(m);
    }
    let metrics = Metrics::register(&REGISTRY)?;
    Ok(METRICS.get_or_init(|| metrics))
}

/// Collectors, if [`register_metrics`] has run.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Render [`REGISTRY`] in the Prometheus text format.
pub fn gather_text() -> prometheus::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Counts and times every call by method and outcome.
pub struct MetricsRecorder {
    metrics: &'static Metrics,
}

impl MetricsRecorder {
    pub fn new(metrics: &'static Metrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Interceptor for MetricsRecorder {
    async fn intercept(
        &self,
        method: &'static str,
        request: CsiMessage,
        next: Next<'_>,
    ) -> CallResult {
        let start = Instant::now();
        let result = next.run(method, request).await;

        let code = match &result {
            Ok(_) => "OK",
            Err(e) => e.code(),
        };
        self.metrics
            .operations
            .with_label_values(&[method, code])
            .inc();
        self.metrics
            .operation_duration
            .with_label_values(&[method])
            .observe(start.elapsed().as_secs_f64());
        result
    }
}
