//! # cbs-csi: CSI driver for Tencent Cloud Block Storage
//!
//! The driver process exposes the `libcsi` Identity, Controller and Node
//! services on a unix socket, keeps a Prometheus `/metrics` endpoint alive,
//! and (on node-colocated instances) periodically stamps provisioned disks
//! with the owning cluster's tag.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`config`] | Flags, environment signals, [`DriverConfig`](config::DriverConfig). |
//! | [`metadata`] | Instance metadata client and region/zone resolution. |
//! | [`cloud`] | Block-storage, compute and tag API seams plus the HTTP client. |
//! | [`cluster`] | Orchestrator seam: PersistentVolume handles for this driver. |
//! | [`cache`] | Persisted attachment records. |
//! | [`identity`], [`controller`], [`node`] | The three CSI endpoints. |
//! | [`metrics`] | Process registry, call recorder and the `/metrics` supervisor. |
//! | [`tags`], [`scheduler`] | Tag reconciliation and its jittered loop. |
//! | [`driver`] | Composition root. |

pub mod cache;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod metadata;
pub mod metrics;
pub mod node;
pub mod scheduler;
pub mod tags;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cache::FileCachePersister;
use crate::cluster::ApiServerClient;
use crate::config::{Cli, EnvSettings, LogFormat};
use crate::driver::Driver;
use crate::metadata::{HttpMetadataClient, resolve_placement};

pub use error::DriverError;

/// Install the global subscriber.  `RUST_LOG` overrides the `info` default.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolve configuration from `cli` and the environment, then run the
/// driver until it fails.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    // Scheme errors surface before any network or socket work.
    let endpoint = cli.endpoint()?;

    let metadata = Arc::new(HttpMetadataClient::new()?);
    let placement = resolve_placement(&cli.region, &cli.zone, metadata.as_ref()).await?;
    let cluster = Arc::new(ApiServerClient::from_flags(
        cli.master.as_deref(),
        cli.kubeconfig.as_deref(),
    )?);

    let persister = Arc::new(FileCachePersister::new(cli.cache_dir.clone()));
    let config = cli.into_config(endpoint, placement, EnvSettings::from_env());
    info!(
        region = %config.region,
        zone = %config.zone,
        cluster_id = %config.cluster_id,
        attach_limit = config.attach_limit(),
        tag_sync = config.tag_sync_enabled,
        "starting {} {}",
        crate::config::DRIVER_NAME,
        crate::config::DRIVER_VERSION,
    );

    Driver::new(config, cluster, metadata).run(persister).await?;
    Ok(())
}
