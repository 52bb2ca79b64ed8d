//! Driver configuration.
//!
//! Flags are parsed once with `clap`, environment signals are read once by
//! [`EnvSettings::from_env`], and the result is frozen into a
//! [`DriverConfig`] that the [`Driver`](crate::driver::Driver) owns for the
//! rest of the process.
//!
//! Environment variables:
//! - `CLUSTER_ID`: cluster identity used to scope tag reconciliation.
//! - `ADDRESS`: presence marker; when non-empty this instance runs next to a
//!   node agent and starts the tag-sync scheduler.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use url::Url;

use crate::error::ConfigError;
use crate::metadata::Placement;

pub const DRIVER_NAME: &str = "com.tencent.cloud.csi.cbs";
pub const DRIVER_VERSION: &str = "1.0.0";
pub const TOPOLOGY_ZONE_KEY: &str = "topology.com.tencent.cloud.csi.cbs/zone";

pub const CLUSTER_ID_ENV: &str = "CLUSTER_ID";
pub const NODE_MARKER_ENV: &str = "ADDRESS";

/// Attach limit used when `--volume_attach_limit` is negative.
pub const DEFAULT_VOLUME_ATTACH_LIMIT: u64 = 20;

const DEFAULT_ENDPOINT: &str = "unix:///var/lib/kubelet/plugins/com.tencent.cloud.csi.cbs/csi.sock";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "cbs-csi")]
#[command(
    about = "CSI driver for Tencent Cloud Block Storage",
    long_about = None
)]
pub struct Cli {
    /// CSI endpoint
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Tencent cloud api region
    #[arg(long, default_value = "")]
    pub region: String,

    /// CVM instance zone
    #[arg(long, default_value = "")]
    pub zone: String,

    /// CBS api domain
    #[arg(long = "cbs_url", default_value = "cbs.internal.tencentcloudapi.com")]
    pub cbs_url: String,

    /// Maximum number of volumes attachable per node; negative selects the default of 20.
    #[arg(
        long = "volume_attach_limit",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub volume_attach_limit: i64,

    /// Enable the metrics server; set `false` to close it.
    #[arg(
        long = "enable_metrics_server",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub enable_metrics_server: bool,

    /// Metrics port
    #[arg(long = "metric_port", default_value_t = 9099)]
    pub metric_port: u16,

    /// Interval in minutes for synchronizing cluster and disk tags.
    #[arg(
        long = "time-interval",
        default_value_t = 60,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub time_interval: u32,

    /// Directory holding the persisted attachment cache.
    #[arg(long = "cache_dir", default_value = "/var/lib/csi/cbs/cache")]
    pub cache_dir: PathBuf,

    /// Orchestrator API URL, for running out of cluster.
    #[arg(long)]
    pub master: Option<String>,

    /// Path to a kubeconfig file, for running out of cluster.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Process environment signals, read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSettings {
    pub cluster_id: String,
    pub node_colocated: bool,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        Self {
            cluster_id: std::env::var(CLUSTER_ID_ENV).unwrap_or_default(),
            node_colocated: std::env::var(NODE_MARKER_ENV)
                .map(|v| !v.is_empty())
                .unwrap_or(false),
        }
    }
}

/// A validated listen address.  Only unix sockets are supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    socket_path: PathBuf,
}

impl Endpoint {
    /// Parse `unix:///abs/path.sock` (or `unix://rel/path.sock`).
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: raw.to_owned(),
            reason: e.to_string(),
        })?;

        if url.scheme() != "unix" {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let path = format!("{}{}", url.host_str().unwrap_or(""), url.path());
        if path.is_empty() {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: raw.to_owned(),
                reason: "missing socket path".into(),
            });
        }

        Ok(Self {
            socket_path: PathBuf::from(path),
        })
    }

    pub fn from_socket_path(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Immutable driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub region: String,
    pub zone: String,
    pub cluster_id: String,
    /// Raw flag value; see [`DriverConfig::attach_limit`].
    pub volume_attach_limit: i64,
    pub endpoint: Endpoint,
    pub cbs_url: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub tag_sync_interval: NonZeroU32,
    pub tag_sync_enabled: bool,
}

impl DriverConfig {
    /// Effective per-node attach limit.
    pub fn attach_limit(&self) -> u64 {
        effective_attach_limit(self.volume_attach_limit)
    }

    pub fn tag_sync_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.tag_sync_interval.get()) * 60)
    }
}

pub fn effective_attach_limit(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(DEFAULT_VOLUME_ATTACH_LIMIT)
}

impl Cli {
    /// Validate the endpoint.  Done before any metadata or socket work.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.endpoint)
    }

    /// Freeze flags, resolved placement and environment into a config.
    pub fn into_config(
        self,
        endpoint: Endpoint,
        placement: Placement,
        env: EnvSettings,
    ) -> DriverConfig {
        DriverConfig {
            region: placement.region,
            zone: placement.zone,
            cluster_id: env.cluster_id,
            volume_attach_limit: self.volume_attach_limit,
            endpoint,
            cbs_url: self.cbs_url,
            metrics_enabled: self.enable_metrics_server,
            metrics_port: self.metric_port,
            tag_sync_interval: NonZeroU32::new(self.time_interval).unwrap_or(NonZeroU32::MIN),
            tag_sync_enabled: env.node_colocated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn unix_endpoint_absolute_path() {
        let ep = Endpoint::parse("unix:///var/lib/kubelet/plugins/cbs/csi.sock").unwrap();
        assert_eq!(
            ep.socket_path(),
            Path::new("/var/lib/kubelet/plugins/cbs/csi.sock")
        );
    }

    #[test]
    fn unix_endpoint_host_is_joined() {
        let ep = Endpoint::parse("unix://tmp/csi.sock").unwrap();
        assert_eq!(ep.socket_path(), Path::new("tmp/csi.sock"));
    }

    #[test]
    fn tcp_endpoint_is_rejected() {
        let err = Endpoint::parse("tcp://127.0.0.1:10000").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(s) if s == "tcp"));
    }

    #[test]
    fn garbage_endpoint_is_invalid() {
        let err = Endpoint::parse("not a url").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));
    }

    #[test]
    fn negative_attach_limit_uses_default() {
        assert_eq!(effective_attach_limit(-1), DEFAULT_VOLUME_ATTACH_LIMIT);
        assert_eq!(effective_attach_limit(0), 0);
        assert_eq!(effective_attach_limit(64), 64);
    }

    #[test]
    fn cli_defaults_match_driver_defaults() {
        let cli = Cli::try_parse_from(["cbs-csi"]).unwrap();
        assert_eq!(cli.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cli.cbs_url, "cbs.internal.tencentcloudapi.com");
        assert_eq!(cli.volume_attach_limit, -1);
        assert!(cli.enable_metrics_server);
        assert_eq!(cli.metric_port, 9099);
        assert_eq!(cli.time_interval, 60);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn cli_accepts_underscore_flag_names() {
        let cli = Cli::try_parse_from([
            "cbs-csi",
            "--endpoint=unix:///tmp/csi.sock",
            "--region=ap-guangzhou",
            "--volume_attach_limit=-5",
            "--enable_metrics_server=false",
            "--metric_port=9100",
            "--time-interval=5",
        ])
        .unwrap();
        assert_eq!(cli.region, "ap-guangzhou");
        assert_eq!(cli.volume_attach_limit, -5);
        assert!(!cli.enable_metrics_server);
        assert_eq!(cli.metric_port, 9100);
        assert_eq!(cli.time_interval, 5);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let parsed = Cli::try_parse_from(["cbs-csi", "--time-interval=0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn into_config_carries_resolved_values() {
        let cli = Cli::try_parse_from(["cbs-csi", "--time-interval=15"]).unwrap();
        let endpoint = cli.endpoint().unwrap();
        let config = cli.into_config(
            endpoint,
            Placement {
                region: "ap-guangzhou".into(),
                zone: "200003".into(),
            },
            EnvSettings {
                cluster_id: "cls-abc".into(),
                node_colocated: true,
            },
        );
        assert_eq!(config.region, "ap-guangzhou");
        assert_eq!(config.zone, "200003");
        assert_eq!(config.cluster_id, "cls-abc");
        assert!(config.tag_sync_enabled);
        assert_eq!(config.tag_sync_period(), Duration::from_secs(15 * 60));
        assert_eq!(config.attach_limit(), DEFAULT_VOLUME_ATTACH_LIMIT);
    }

    #[test]
    #[serial]
    fn env_marker_presence_enables_tag_sync() {
        // SAFETY: serialised with every other env-touching test.
        unsafe {
            std::env::set_var(NODE_MARKER_ENV, "10.0.0.8");
            std::env::set_var(CLUSTER_ID_ENV, "cls-xyz");
        }
        let env = EnvSettings::from_env();
        assert!(env.node_colocated);
        assert_eq!(env.cluster_id, "cls-xyz");

        unsafe {
            std::env::remove_var(NODE_MARKER_ENV);
            std::env::remove_var(CLUSTER_ID_ENV);
        }
        let env = EnvSettings::from_env();
        assert!(!env.node_colocated);
        assert!(env.cluster_id.is_empty());
    }

    #[test]
    #[serial]
    fn empty_env_marker_does_not_enable_tag_sync() {
        unsafe { std::env::set_var(NODE_MARKER_ENV, "") };
        assert!(!EnvSettings::from_env().node_colocated);
        unsafe { std::env::remove_var(NODE_MARKER_ENV) };
    }
}
