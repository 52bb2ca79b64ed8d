//! Composition root.
//!
//! [`Driver::run`] wires the endpoints, interceptors and background tasks
//! together in a fixed order and serves until the listener fails:
//!
//! 1. controller endpoint, extension cache loaded (fatal on failure)
//! 2. identity and node endpoints
//! 3. interceptor chain: request logger, then metrics recorder
//! 4. metrics registration and supervisor, when enabled
//! 5. all three endpoints on one server
//! 6. stale socket removal
//! 7. tag-sync scheduler, when this instance runs next to a node agent
//! 8. bind and serve

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use libcsi::transport::{CsiServer, Interceptor, RequestLogger};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::CachePersister;
use crate::cloud::CloudClients;
use crate::cluster::ClusterClient;
use crate::config::DriverConfig;
use crate::controller::CbsController;
use crate::error::DriverError;
use crate::identity::CbsIdentity;
use crate::metadata::MetadataService;
use crate::metrics::{self, MetricsRecorder, MetricsSupervisor};
use crate::node::CbsNode;
use crate::scheduler::TagSyncScheduler;
use crate::tags::DiskTagReconciler;

pub struct Driver {
    config: DriverConfig,
    cluster: Arc<dyn ClusterClient>,
    metadata: Arc<dyn MetadataService>,
    running: AtomicBool,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        cluster: Arc<dyn ClusterClient>,
        metadata: Arc<dyn MetadataService>,
    ) -> Self {
        Self {
            config,
            cluster,
            metadata,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Serve against the real cloud APIs.  Returns only on a fatal error.
    pub async fn run(&self, persister: Arc<dyn CachePersister>) -> Result<(), DriverError> {
        let clients = CloudClients::http(&self.config.cbs_url, &self.config.region)?;
        self.run_with(clients, persister, CancellationToken::new())
            .await
    }

    /// Serve with the given cloud clients until a fatal error or until
    /// `shutdown` is cancelled.
    pub async fn run_with(
        &self,
        clients: CloudClients,
        persister: Arc<dyn CachePersister>,
        shutdown: CancellationToken,
    ) -> Result<(), DriverError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DriverError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);
        // Background tasks stop with this call, however it returns.
        let tasks = shutdown.child_token();
        let _stop_tasks = tasks.clone().drop_guard();
        let cfg = &self.config;

        let controller = CbsController::new(
            cfg.region.clone(),
            cfg.zone.clone(),
            cfg.cluster_id.clone(),
            clients.clone(),
            persister,
        );
        controller
            .load_extension_data()
            .await
            .map_err(DriverError::CacheLoad)?;

        let identity = CbsIdentity::new();
        let node = CbsNode::new(
            cfg.zone.clone(),
            cfg.attach_limit(),
            Arc::clone(&self.metadata),
        );

        let mut chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(RequestLogger)];
        if cfg.metrics_enabled {
            let collectors = metrics::register_metrics().map_err(DriverError::Metrics)?;
            chain.push(Arc::new(MetricsRecorder::new(collectors)));
            let supervisor = MetricsSupervisor::new(cfg.metrics_port);
            tokio::spawn(supervisor.run(tasks.child_token()));
        }

        let server = chain
            .into_iter()
            .fold(CsiServer::new(), CsiServer::with_interceptor)
            .register_identity(Arc::new(identity))
            .register_controller(Arc::new(controller))
            .register_node(Arc::new(node));

        let path = cfg.endpoint.socket_path();
        remove_stale_socket(path)?;

        if cfg.tag_sync_enabled {
            let reconciler = DiskTagReconciler::new(
                clients,
                Arc::clone(&self.cluster),
                cfg.region.clone(),
                cfg.cluster_id.clone(),
            );
            let period = cfg.tag_sync_period();
            let scheduler = TagSyncScheduler::with_os_rng(period, Arc::new(reconciler));
            tokio::spawn(scheduler.run(tasks.child_token()));
            info!(
                interval_minutes = cfg.tag_sync_interval.get(),
                "tag sync scheduler started"
            );
        }

        let listener = UnixListener::bind(path).map_err(|source| DriverError::Listen {
            path: path.to_owned(),
            source,
        })?;
        info!(path = %path.display(), "Listening for connections");

        server
            .serve_with_shutdown(listener, shutdown.cancelled_owned())
            .await
            .map_err(DriverError::Serve)
    }
}

/// Clears the running flag when `run_with` returns.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Make `path` vacant for a fresh bind.
fn remove_stale_socket(path: &Path) -> Result<(), DriverError> {
    let prepare_err = |source| DriverError::SocketPrepare {
        path: path.to_owned(),
        source,
    };

    match std::fs::symlink_metadata(path) {
        Ok(_) => {
            warn!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(prepare_err)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(prepare_err(e)),
    }
}
