//! Instance metadata lookup and region/zone resolution.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{ConfigError, MetadataError};

pub const METADATA_ENDPOINT: &str = "http://metadata.tencentyun.com/latest/meta-data";

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Keys the driver reads from the instance metadata service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    Region,
    Zone,
    InstanceId,
}

impl MetadataKey {
    /// Path relative to the metadata root.
    pub fn path(self) -> &'static str {
        match self {
            Self::Region => "placement/region",
            Self::Zone => "placement/zone",
            Self::InstanceId => "instance-id",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Region => "REGION",
            Self::Zone => "ZONE",
            Self::InstanceId => "INSTANCE_ID",
        }
    }
}

/// Read access to the instance metadata service.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn get(&self, key: MetadataKey) -> Result<String, MetadataError>;
}

/// Metadata client over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetadataClient {
    http: reqwest::Client,
    base: String,
}

impl HttpMetadataClient {
    pub fn new() -> Result<Self, MetadataError> {
        Self::with_base(METADATA_ENDPOINT)
    }

    pub fn with_base(base: impl Into<String>) -> Result<Self, MetadataError> {
        let http = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| MetadataError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl MetadataService for HttpMetadataClient {
    async fn get(&self, key: MetadataKey) -> Result<String, MetadataError> {
        let url = format!("{}/{}", self.base, key.path());
        debug!(%url, "querying instance metadata");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| MetadataError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MetadataError::Status(resp.status().as_u16()));
        }

        let value = resp
            .text()
            .await
            .map_err(|e| MetadataError::Request(e.to_string()))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(MetadataError::Empty);
        }
        Ok(value.to_owned())
    }
}

/// Concrete region and zone the driver runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub region: String,
    pub zone: String,
}

/// Fill in whichever of `region`/`zone` is empty from the metadata service.
///
/// Values that were configured explicitly are returned untouched.  A failed
/// lookup aborts startup.
pub async fn resolve_placement(
    region: &str,
    zone: &str,
    metadata: &dyn MetadataService,
) -> Result<Placement, ConfigError> {
    let region = resolve_one(region, MetadataKey::Region, metadata).await?;
    let zone = resolve_one(zone, MetadataKey::Zone, metadata).await?;
    info!(%region, %zone, "placement resolved");
    Ok(Placement { region, zone })
}

async fn resolve_one(
    configured: &str,
    key: MetadataKey,
    metadata: &dyn MetadataService,
) -> Result<String, ConfigError> {
    if !configured.is_empty() {
        return Ok(configured.to_owned());
    }
    metadata
        .get(key)
        .await
        .map_err(|source| ConfigError::Metadata {
            key: key.name(),
            source,
        })
}
