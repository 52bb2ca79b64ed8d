//! Orchestrator access.
//!
//! Tag reconciliation only needs one thing from the cluster: the disk ids
//! backing PersistentVolumes provisioned by this driver.  [`ClusterClient`]
//! is that seam; [`ApiServerClient`] implements it against the cluster API
//! server, configured either in-cluster (service account) or from
//! `--master` / `--kubeconfig`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ClusterError;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Volume handles of every PersistentVolume whose CSI driver is `driver`.
    async fn list_volume_handles(&self, driver: &str) -> Result<Vec<String>, ClusterError>;
}

pub struct ApiServerClient {
    http: reqwest::Client,
    server: String,
    token: Option<String>,
}

impl ApiServerClient {
    /// Build from flags if either is set, otherwise from the in-cluster
    /// service account.
    pub fn from_flags(
        master: Option<&str>,
        kubeconfig: Option<&Path>,
    ) -> Result<Self, ClusterError> {
        if master.is_some() || kubeconfig.is_some() {
            info!("building orchestrator client from master/kubeconfig");
            Self::out_of_cluster(master, kubeconfig)
        } else {
            info!("building in-cluster orchestrator client");
            Self::in_cluster()
        }
    }

    pub fn in_cluster() -> Result<Self, ClusterError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ClusterError::Config("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| ClusterError::Config("KUBERNETES_SERVICE_PORT is not set".into()))?;
        let dir = Path::new(SERVICE_ACCOUNT_DIR);

        let token = std::fs::read_to_string(dir.join("token"))
            .map_err(|e| ClusterError::Config(format!("read service account token: {e}")))?;
        let ca = std::fs::read(dir.join("ca.crt"))
            .map_err(|e| ClusterError::Config(format!("read service account CA: {e}")))?;

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        Self::build(
            format!("https://{host}:{port}"),
            Some(token.trim().to_owned()),
            Some(&ca),
            false,
        )
    }

    fn out_of_cluster(
        master: Option<&str>,
        kubeconfig: Option<&Path>,
    ) -> Result<Self, ClusterError> {
        let kc = kubeconfig.map(Kubeconfig::load).transpose()?;

        let server = match (master, kc.as_ref()) {
            (Some(m), _) => m.to_owned(),
            (None, Some(kc)) => kc.server()?.to_owned(),
            (None, None) => {
                return Err(ClusterError::Config("no master or kubeconfig".into()));
            }
        };
        let token = kc.as_ref().and_then(|kc| kc.token().map(str::to_owned));
        let ca = kc.as_ref().map(Kubeconfig::ca_pem).transpose()?.flatten();
        let insecure = kc.as_ref().is_some_and(Kubeconfig::insecure);

        Self::build(server, token, ca.as_deref(), insecure)
    }

    fn build(
        server: String,
        token: Option<String>,
        ca_pem: Option<&[u8]>,
        insecure: bool,
    ) -> Result<Self, ClusterError> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure);
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| ClusterError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| ClusterError::Config(e.to_string()))?;

        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_owned(),
            token,
        })
    }
}

#[async_trait]
impl ClusterClient for ApiServerClient {
    async fn list_volume_handles(&self, driver: &str) -> Result<Vec<String>, ClusterError> {
        let url = format!("{}/api/v1/persistentvolumes", self.server);
        let mut req = self.http.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ClusterError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClusterError::Status(resp.status().as_u16()));
        }
        let list: PersistentVolumeList = resp
            .json()
            .await
            .map_err(|e| ClusterError::Request(e.to_string()))?;

        let handles = list.volume_handles(driver);
        debug!(driver, count = handles.len(), "listed persistent volumes");
        Ok(handles)
    }
}

// ---------------------------------------------------------------------------
// PersistentVolume list
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PersistentVolumeList {
    #[serde(default)]
    items: Vec<PersistentVolume>,
}

#[derive(Debug, Deserialize)]
struct PersistentVolume {
    #[serde(default)]
    spec: PersistentVolumeSpec,
}

#[derive(Debug, Default, Deserialize)]
struct PersistentVolumeSpec {
    csi: Option<CsiSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsiSource {
    driver: String,
    volume_handle: String,
}

impl PersistentVolumeList {
    fn volume_handles(self, driver: &str) -> Vec<String> {
        self.items
            .into_iter()
            .filter_map(|pv| pv.spec.csi)
            .filter(|csi| csi.driver == driver && !csi.volume_handle.is_empty())
            .map(|csi| csi.volume_handle)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Kubeconfig (the subset needed to reach the API server)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    user: UserEntry,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    token: Option<String>,
}

impl Kubeconfig {
    fn load(path: &Path) -> Result<Self, ClusterError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::Config(format!("read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<Self, ClusterError> {
        serde_yaml::from_str(raw)
            .map_err(|e| ClusterError::Config(format!("parse kubeconfig: {e}")))
    }

    fn cluster(&self) -> Result<&ClusterEntry, ClusterError> {
        self.clusters
            .first()
            .map(|c| &c.cluster)
            .ok_or_else(|| ClusterError::Config("kubeconfig has no clusters".into()))
    }

    fn server(&self) -> Result<&str, ClusterError> {
        Ok(&self.cluster()?.server)
    }

    fn token(&self) -> Option<&str> {
        self.users.first().and_then(|u| u.user.token.as_deref())
    }

    fn insecure(&self) -> bool {
        self.cluster().is_ok_and(|c| c.insecure_skip_tls_verify)
    }

    fn ca_pem(&self) -> Result<Option<Vec<u8>>, ClusterError> {
        let Some(path) = self.cluster()?.certificate_authority.as_deref() else {
            return Ok(None);
        };
        std::fs::read(path)
            .map(Some)
            .map_err(|e| ClusterError::Config(format!("read CA {path}: {e}")))
    }
}
