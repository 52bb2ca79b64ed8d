//! End-to-end startup behaviour of the driver against in-memory clouds.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cbs_csi::cache::FileCachePersister;
use cbs_csi::cloud::{
    BlockStorage, CLUSTER_TAG_KEY, CloudClients, CreateDiskSpec, Disk, Instance, Instances, Tag,
    Tags,
};
use cbs_csi::cluster::ClusterClient;
use cbs_csi::config::{Cli, DriverConfig, Endpoint, EnvSettings, TOPOLOGY_ZONE_KEY};
use cbs_csi::driver::Driver;
use cbs_csi::error::{CloudError, ClusterError, ConfigError, DriverError, MetadataError};
use cbs_csi::metadata::{MetadataKey, MetadataService, resolve_placement};
use clap::Parser;
use libcsi::CsiMessage;
use libcsi::transport::CsiClient;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Cloud {
    disks: Mutex<HashMap<String, Disk>>,
    tag_calls: Mutex<Vec<(String, Vec<Tag>)>>,
    tagged: Notify,
}

#[async_trait]
impl BlockStorage for Cloud {
    async fn describe_disks(&self, disk_ids: &[String]) -> Result<Vec<Disk>, CloudError> {
        let disks = self.disks.lock().unwrap();
        Ok(disk_ids
            .iter()
            .filter_map(|id| disks.get(id).cloned())
            .collect())
    }

    async fn find_disk_by_name(&self, _name: &str) -> Result<Option<Disk>, CloudError> {
        Ok(None)
    }

    async fn create_disk(&self, _spec: &CreateDiskSpec) -> Result<String, CloudError> {
        Err(CloudError::Build("read-only test cloud".into()))
    }

    async fn delete_disk(&self, _disk_id: &str) -> Result<(), CloudError> {
        Ok(())
    }

    async fn attach_disk(&self, _disk_id: &str, _instance_id: &str) -> Result<(), CloudError> {
        Ok(())
    }

    async fn detach_disk(&self, _disk_id: &str, _instance_id: &str) -> Result<(), CloudError> {
        Ok(())
    }
}

#[async_trait]
impl Instances for Cloud {
    async fn describe_instances(&self, _ids: &[String]) -> Result<Vec<Instance>, CloudError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl Tags for Cloud {
    async fn modify_resource_tags(
        &self,
        resource: &str,
        replace: &[Tag],
    ) -> Result<(), CloudError> {
        self.tag_calls
            .lock()
            .unwrap()
            .push((resource.to_owned(), replace.to_vec()));
        self.tagged.notify_one();
        Ok(())
    }
}

fn clients(cloud: &Arc<Cloud>) -> CloudClients {
    CloudClients {
        cbs: cloud.clone(),
        cvm: cloud.clone(),
        tag: cloud.clone(),
    }
}

#[derive(Default)]
struct Cluster {
    handles: Vec<String>,
    calls: Mutex<Vec<Instant>>,
}

#[async_trait]
impl ClusterClient for Cluster {
    async fn list_volume_handles(&self, _driver: &str) -> Result<Vec<String>, ClusterError> {
        self.calls.lock().unwrap().push(Instant::now());
        Ok(self.handles.clone())
    }
}

#[derive(Default)]
struct Metadata(HashMap<MetadataKey, String>);

#[async_trait]
impl MetadataService for Metadata {
    async fn get(&self, key: MetadataKey) -> Result<String, MetadataError> {
        self.0.get(&key).cloned().ok_or(MetadataError::Status(404))
    }
}

fn config(socket: &Path) -> DriverConfig {
    DriverConfig {
        region: "ap-guangzhou".into(),
        zone: "ap-guangzhou-3".into(),
        cluster_id: "cls-abc".into(),
        volume_attach_limit: -1,
        endpoint: Endpoint::from_socket_path(socket),
        cbs_url: "cbs.internal.tencentcloudapi.com".into(),
        metrics_enabled: false,
        metrics_port: 0,
        tag_sync_interval: NonZeroU32::new(60).unwrap(),
        tag_sync_enabled: false,
    }
}

struct Running {
    task: JoinHandle<Result<(), DriverError>>,
    shutdown: CancellationToken,
}

fn spawn(
    config: DriverConfig,
    cluster: Arc<Cluster>,
    metadata: Metadata,
    cloud: &Arc<Cloud>,
    cache_dir: PathBuf,
) -> Running {
    let driver = Driver::new(config, cluster, Arc::new(metadata));
    let clients = clients(cloud);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        driver
            .run_with(clients, Arc::new(FileCachePersister::new(cache_dir)), token)
            .await
    });
    Running { task, shutdown }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn scrape(port: u16) -> String {
    let url = format!("http://127.0.0.1:{port}/metrics");
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match reqwest::get(&url).await {
                Ok(resp) if resp.status().is_success() => return resp.text().await.unwrap(),
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("metrics endpoint came up")
}

async fn connect(socket: &Path) -> CsiClient {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(c) = CsiClient::connect(socket).await {
                return c;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("driver socket came up")
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    std::fs::write(&socket, b"left over from a previous run").unwrap();

    let cloud = Arc::new(Cloud::default());
    let running = spawn(
        config(&socket),
        Arc::default(),
        Metadata::default(),
        &cloud,
        dir.path().join("cache"),
    );

    let client = connect(&socket).await;
    assert_eq!(
        client.call(&CsiMessage::Probe).await.unwrap(),
        CsiMessage::ProbeResult(true)
    );

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unremovable_socket_path_aborts_before_listening() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    std::fs::create_dir(&socket).unwrap();
    std::fs::write(socket.join("keep"), b"x").unwrap();

    let cloud = Arc::new(Cloud::default());
    let running = spawn(
        config(&socket),
        Arc::default(),
        Metadata::default(),
        &cloud,
        dir.path().join("cache"),
    );

    let err = running.task.await.unwrap().unwrap_err();
    let DriverError::SocketPrepare { path, .. } = &err else {
        panic!("expected a socket preparation error, got {err:?}");
    };
    assert_eq!(path, &socket);
    assert!(socket.is_dir(), "directory was left in place");
}

#[tokio::test]
async fn failing_existence_check_aborts_before_listening() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"").unwrap();
    let socket = file.join("csi.sock");

    let cloud = Arc::new(Cloud::default());
    let running = spawn(
        config(&socket),
        Arc::default(),
        Metadata::default(),
        &cloud,
        dir.path().join("cache"),
    );

    let err = running.task.await.unwrap().unwrap_err();
    assert!(matches!(err, DriverError::SocketPrepare { .. }));
}

#[tokio::test]
async fn corrupt_cache_prevents_serving() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    let cache = dir.path().join("cache");
    std::fs::create_dir(&cache).unwrap();
    std::fs::write(cache.join("disk-1.json"), b"{truncated").unwrap();

    let cloud = Arc::new(Cloud::default());
    let running = spawn(
        config(&socket),
        Arc::default(),
        Metadata::default(),
        &cloud,
        cache,
    );

    let err = running.task.await.unwrap().unwrap_err();
    assert!(matches!(err, DriverError::CacheLoad(_)));
    assert!(!socket.exists());
}

#[tokio::test]
async fn unsupported_scheme_fails_before_any_socket_work() {
    let dir = tempfile::tempdir().unwrap();
    let cli = Cli::try_parse_from([
        "cbs-csi",
        "--endpoint=tcp://127.0.0.1:10000",
        "--region=ap-guangzhou",
        "--zone=200003",
        "--cache_dir",
        dir.path().join("cache").to_str().unwrap(),
    ])
    .unwrap();

    let err = cbs_csi::run(cli).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::UnsupportedScheme(s)) if s == "tcp"
    ));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn resolved_placement_reaches_the_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    let metadata = Metadata(HashMap::from([
        (MetadataKey::Region, "ap-guangzhou".to_owned()),
        (MetadataKey::Zone, "200003".to_owned()),
        (MetadataKey::InstanceId, "ins-node1".to_owned()),
    ]));

    let cli = Cli::try_parse_from(["cbs-csi"]).unwrap();
    let placement = resolve_placement(&cli.region, &cli.zone, &metadata)
        .await
        .unwrap();
    let config = cli.into_config(
        Endpoint::from_socket_path(&socket),
        placement,
        EnvSettings::default(),
    );
    assert_eq!(config.region, "ap-guangzhou");
    assert_eq!(config.zone, "200003");

    let cloud = Arc::new(Cloud::default());
    let running = spawn(
        config,
        Arc::default(),
        metadata,
        &cloud,
        dir.path().join("cache"),
    );

    let client = connect(&socket).await;
    let reply = client.call(&CsiMessage::GetNodeInfo).await.unwrap();
    let CsiMessage::NodeInfoResponse(info) = reply else {
        panic!("expected node info, got {reply:?}");
    };
    assert_eq!(info.node_id, "ins-node1");
    assert_eq!(info.max_volumes, 20);
    let topology = info.accessible_topology.unwrap();
    assert_eq!(topology.segments[TOPOLOGY_ZONE_KEY], "200003");

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn without_node_marker_no_reconciliation_happens() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    let cluster = Arc::new(Cluster {
        handles: vec!["disk-1".into()],
        ..Default::default()
    });

    let cloud = Arc::new(Cloud::default());
    let running = spawn(
        config(&socket),
        cluster.clone(),
        Metadata::default(),
        &cloud,
        dir.path().join("cache"),
    );

    tokio::time::sleep(Duration::from_secs(10 * 3600)).await;
    assert!(cluster.calls.lock().unwrap().is_empty());
    assert!(cloud.tag_calls.lock().unwrap().is_empty());

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn node_marker_starts_jittered_reconciliation() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    let cluster = Arc::new(Cluster {
        handles: vec!["disk-1".into()],
        ..Default::default()
    });
    let cloud = Arc::new(Cloud::default());
    let disk = Disk {
        disk_id: "disk-1".into(),
        ..Default::default()
    };
    cloud.disks.lock().unwrap().insert("disk-1".into(), disk);

    let mut cfg = config(&socket);
    cfg.tag_sync_enabled = true;
    let start = Instant::now();
    let running = spawn(
        cfg,
        cluster.clone(),
        Metadata::default(),
        &cloud,
        dir.path().join("cache"),
    );

    cloud.tagged.notified().await;
    let first = cluster.calls.lock().unwrap()[0];
    assert!(first - start < Duration::from_secs(60 * 60));

    let calls = cloud.tag_calls.lock().unwrap().clone();
    assert_eq!(calls[0].0, "qcs::cvm:ap-guangzhou::volume/disk-1");
    assert_eq!(calls[0].1, vec![Tag::new(CLUSTER_TAG_KEY, "cls-abc")]);

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn metrics_endpoint_counts_served_calls() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    let port = free_port();
    let mut cfg = config(&socket);
    cfg.metrics_enabled = true;
    cfg.metrics_port = port;

    let cloud = Arc::new(Cloud::default());
    let running = spawn(
        cfg,
        Arc::default(),
        Metadata::default(),
        &cloud,
        dir.path().join("cache"),
    );

    let client = connect(&socket).await;
    let reply = client.call(&CsiMessage::Probe).await.unwrap();
    assert_eq!(reply, CsiMessage::ProbeResult(true));

    let body = scrape(port).await;
    let served = body.lines().any(|line| {
        line.starts_with("csi_operations_total")
            && line.contains(r#"method="/csi.v1.Identity/Probe""#)
            && line.contains(r#"code="OK""#)
    });
    assert!(served, "identity call not counted in:\n{body}");

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_start_releases_the_metrics_port() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"").unwrap();
    let port = free_port();
    let mut cfg = config(&file.join("csi.sock"));
    cfg.metrics_enabled = true;
    cfg.metrics_port = port;

    let cloud = Arc::new(Cloud::default());
    let running = spawn(
        cfg,
        Arc::default(),
        Metadata::default(),
        &cloud,
        dir.path().join("cache"),
    );
    let err = running.task.await.unwrap().unwrap_err();
    assert!(matches!(err, DriverError::SocketPrepare { .. }));

    tokio::time::timeout(Duration::from_secs(5), async {
        while std::net::TcpListener::bind(("0.0.0.0", port)).is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("metrics port was released");
}
