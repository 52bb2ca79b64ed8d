//! Controller endpoint: disk lifecycle against the block-storage API.
//!
//! Attachments are remembered in an in-memory map mirrored to a
//! [`CachePersister`].  [`CbsController::load_extension_data`] must succeed
//! before the endpoint is served.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use libcsi::{
    AccessMode, ControllerCapability, ControllerPublishVolumeRequest,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, CsiController, CsiError, PublishContext,
    Topology, Volume, VolumeCapability, VolumeId,
};
use tracing::{debug, info, instrument, warn};

use crate::cache::{AttachmentRecord, CachePersister};
use crate::cloud::{CLUSTER_TAG_KEY, CloudClients, CreateDiskSpec, Disk, Tag};
use crate::config::TOPOLOGY_ZONE_KEY;
use crate::error::CacheError;

const GIB: u64 = 1 << 30;
/// Smallest disk the block-storage API will create.
pub const MIN_DISK_SIZE_GB: u64 = 10;

pub const PARAM_DISK_TYPE: &str = "diskType";
pub const DEFAULT_DISK_TYPE: &str = "CLOUD_PREMIUM";

/// Publish-context key carrying the device path on the node.
pub const DEVICE_PATH_KEY: &str = "devicePath";

pub fn device_path(disk_id: &str) -> String {
    format!("/dev/disk/by-id/virtio-{disk_id}")
}

/// Requested bytes rounded up to whole GiB, never below the API minimum.
pub fn disk_size_gb(capacity_bytes: u64) -> u64 {
    capacity_bytes.div_ceil(GIB).max(MIN_DISK_SIZE_GB)
}

pub struct CbsController {
    region: String,
    zone: String,
    cluster_id: String,
    clients: CloudClients,
    persister: Arc<dyn CachePersister>,
    attachments: DashMap<String, AttachmentRecord>,
}

impl CbsController {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        cluster_id: impl Into<String>,
        clients: CloudClients,
        persister: Arc<dyn CachePersister>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            cluster_id: cluster_id.into(),
            clients,
            persister,
            attachments: DashMap::new(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Load every persisted attachment record.  Returns how many were loaded.
    pub async fn load_extension_data(&self) -> Result<usize, CacheError> {
        let records = self.persister.load_all().await?;
        let count = records.len();
        for record in records {
            self.attachments.insert(record.volume_id.clone(), record);
        }
        info!(count, "extension data loaded");
        Ok(count)
    }

    pub fn attachment(&self, volume_id: &str) -> Option<AttachmentRecord> {
        self.attachments.get(volume_id).map(|r| r.clone())
    }

    fn publish_context(disk_id: &str) -> PublishContext {
        HashMap::from([(DEVICE_PATH_KEY.to_owned(), device_path(disk_id))])
    }

    fn requested_zone(&self, req: &CreateVolumeRequest) -> String {
        req.accessibility_requirements
            .iter()
            .find_map(|t| t.segments.get(TOPOLOGY_ZONE_KEY))
            .cloned()
            .unwrap_or_else(|| self.zone.clone())
    }

    fn to_volume(disk: &Disk) -> Volume {
        Volume {
            volume_id: VolumeId(disk.disk_id.clone()),
            capacity_bytes: disk.size_gb * GIB,
            volume_context: HashMap::new(),
            accessible_topology: vec![Topology {
                segments: HashMap::from([(TOPOLOGY_ZONE_KEY.to_owned(), disk.zone.clone())]),
            }],
        }
    }

    async fn describe_one(&self, disk_id: &str) -> Result<Option<Disk>, CsiError> {
        let mut disks = self
            .clients
            .cbs
            .describe_disks(&[disk_id.to_owned()])
            .await?;
        Ok(disks.pop())
    }

    async fn forget(&self, volume_id: &str) -> Result<(), CsiError> {
        self.persister.remove(volume_id).await?;
        self.attachments.remove(volume_id);
        Ok(())
    }
}

#[async_trait]
impl CsiController for CbsController {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        let size_gb = disk_size_gb(req.capacity_bytes);

        if let Some(existing) = self.clients.cbs.find_disk_by_name(&req.name).await? {
            if existing.size_gb < size_gb {
                return Err(CsiError::VolumeAlreadyExists(req.name));
            }
            debug!(disk_id = %existing.disk_id, "disk already exists, returning it");
            return Ok(Self::to_volume(&existing));
        }

        let mut tags = Vec::new();
        if !self.cluster_id.is_empty() {
            tags.push(Tag::new(CLUSTER_TAG_KEY, self.cluster_id.clone()));
        }
        let spec = CreateDiskSpec {
            name: req.name.clone(),
            size_gb,
            zone: self.requested_zone(&req),
            disk_type: req
                .parameters
                .get(PARAM_DISK_TYPE)
                .cloned()
                .unwrap_or_else(|| DEFAULT_DISK_TYPE.to_owned()),
            tags,
        };

        let disk_id = self.clients.cbs.create_disk(&spec).await?;
        info!(%disk_id, size_gb, zone = %spec.zone, "disk created");

        Ok(Self::to_volume(&Disk {
            disk_id,
            disk_name: spec.name,
            size_gb,
            zone: spec.zone,
            instance_id: None,
            tags: spec.tags,
        }))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if self.describe_one(&volume_id.0).await?.is_none() {
            debug!("disk already gone");
            return self.forget(&volume_id.0).await;
        }
        self.clients.cbs.delete_disk(&volume_id.0).await?;
        self.forget(&volume_id.0).await?;
        info!("disk deleted");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError> {
        let disk_id = req.volume_id.0.as_str();
        if req.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }

        if self
            .attachment(disk_id)
            .is_some_and(|r| r.instance_id == req.node_id)
        {
            debug!("attachment cached, assuming idempotent retry");
            return Ok(Self::publish_context(disk_id));
        }

        let disk = self
            .describe_one(disk_id)
            .await?
            .ok_or_else(|| CsiError::VolumeNotFound(disk_id.to_owned()))?;
        match disk.instance_id.as_deref() {
            Some(node) if node == req.node_id => {
                debug!("disk already attached to this node");
            }
            Some(other) => {
                return Err(CsiError::BackendError(format!(
                    "disk {disk_id} is attached to {other}"
                )));
            }
            None => {
                self.clients.cbs.attach_disk(disk_id, &req.node_id).await?;
                info!("disk attached");
            }
        }

        let record = AttachmentRecord::new(disk_id, req.node_id.clone());
        self.persister.persist(&record).await?;
        self.attachments.insert(disk_id.to_owned(), record);
        Ok(Self::publish_context(disk_id))
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        let disk_id = req.volume_id.0.as_str();
        let Some(disk) = self.describe_one(disk_id).await? else {
            debug!("disk gone, nothing to detach");
            return self.forget(disk_id).await;
        };

        match disk.instance_id.as_deref() {
            None => debug!("disk not attached"),
            Some(node) if !req.node_id.is_empty() && node != req.node_id => {
                warn!(attached_to = node, "disk attached elsewhere, leaving it");
            }
            Some(node) => {
                self.clients.cbs.detach_disk(disk_id, node).await?;
                info!(instance_id = node, "disk detached");
            }
        }
        self.forget(disk_id).await
    }

    #[instrument(skip(self, capabilities))]
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if self.describe_one(&volume_id.0).await?.is_none() {
            return Err(CsiError::VolumeNotFound(volume_id.0.clone()));
        }
        Ok(capabilities
            .iter()
            .all(|c| c.access_mode == AccessMode::ReadWriteOnce))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        Err(CsiError::Unimplemented("ListVolumes".into()))
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented("GetCapacity".into()))
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
        ])
    }
}
