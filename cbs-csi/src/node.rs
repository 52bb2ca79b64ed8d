//! Node endpoint: format, mount and bind-mount attached disks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libcsi::{
    CsiError, CsiNode, NodeCapability, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, Topology, VolumeId,
};
use nix::mount::MsFlags;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::config::TOPOLOGY_ZONE_KEY;
use crate::controller::{DEVICE_PATH_KEY, device_path};
use crate::metadata::{MetadataKey, MetadataService};

pub struct CbsNode {
    zone: String,
    attach_limit: u64,
    metadata: Arc<dyn MetadataService>,
    instance_id: OnceCell<String>,
}

impl CbsNode {
    pub fn new(
        zone: impl Into<String>,
        attach_limit: u64,
        metadata: Arc<dyn MetadataService>,
    ) -> Self {
        Self {
            zone: zone.into(),
            attach_limit,
            metadata,
            instance_id: OnceCell::new(),
        }
    }

    async fn instance_id(&self) -> Result<&str, CsiError> {
        let id = self
            .instance_id
            .get_or_try_init(|| async {
                self.metadata
                    .get(MetadataKey::InstanceId)
                    .await
                    .map_err(|e| CsiError::Internal(format!("lookup instance id: {e}")))
            })
            .await?;
        Ok(id.as_str())
    }
}

/// Return `true` if `path` is listed as a mount point in `/proc/self/mounts`.
///
/// Mount paths with whitespace would appear octal-escaped; kubelet never
/// hands those out, so a plain comparison is enough.
async fn is_mountpoint(path: &str) -> bool {
    let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
        Ok(c) => c,
        Err(_) => return false,
    };
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

/// Filesystem type already on `device`, or `None` for a blank disk.
async fn existing_fs_type(device: &str) -> Result<Option<String>, CsiError> {
    let output = Command::new("blkid")
        .args(["-o", "value", "-s", "TYPE", device])
        .output()
        .await
        .map_err(|e| CsiError::MountFailed {
            path: device.to_owned(),
            reason: format!("run blkid: {e}"),
        })?;

    // Exit status 2 means no recognisable signature.
    match output.status.code() {
        Some(0) => {
            let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            Ok((!fs.is_empty()).then_some(fs))
        }
        Some(2) => Ok(None),
        code => Err(CsiError::MountFailed {
            path: device.to_owned(),
            reason: format!("blkid exited with {code:?}"),
        }),
    }
}

async fn format_device(device: &str, fs_type: &str) -> Result<(), CsiError> {
    let status = Command::new(format!("mkfs.{fs_type}"))
        .arg(device)
        .status()
        .await
        .map_err(|e| CsiError::MountFailed {
            path: device.to_owned(),
            reason: format!("run mkfs.{fs_type}: {e}"),
        })?;
    if !status.success() {
        return Err(CsiError::MountFailed {
            path: device.to_owned(),
            reason: format!("mkfs.{fs_type} exited with {:?}", status.code()),
        });
    }
    info!(device, fs_type, "device formatted");
    Ok(())
}

#[async_trait]
impl CsiNode for CbsNode {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if is_mountpoint(&req.staging_target_path).await {
            debug!(path = %req.staging_target_path, "staging path already mounted");
            return Ok(());
        }

        let device = req
            .publish_context
            .get(DEVICE_PATH_KEY)
            .cloned()
            .unwrap_or_else(|| device_path(&req.volume_id.0));
        let fs_type = req.volume_capability.fs_type.as_str();

        tokio::fs::create_dir_all(Path::new(&req.staging_target_path))
            .await
            .map_err(|e| CsiError::MountFailed {
                path: req.staging_target_path.clone(),
                reason: e.to_string(),
            })?;

        if existing_fs_type(&device).await?.is_none() {
            format_device(&device, fs_type).await?;
        }

        let options = req.volume_capability.mount_flags.join(",");
        nix::mount::mount(
            Some(device.as_str()),
            req.staging_target_path.as_str(),
            Some(fs_type),
            MsFlags::empty(),
            (!options.is_empty()).then_some(options.as_str()),
        )
        .map_err(|e| CsiError::MountFailed {
            path: req.staging_target_path.clone(),
            reason: e.to_string(),
        })?;

        info!(%device, path = %req.staging_target_path, fs_type, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        if !is_mountpoint(staging_target_path).await {
            debug!("staging path not mounted, nothing to unstage");
            return Ok(());
        }

        nix::mount::umount(staging_target_path).map_err(|e| CsiError::UnmountFailed {
            path: staging_target_path.to_owned(),
            reason: e.to_string(),
        })?;

        info!(path = staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if is_mountpoint(&req.target_path).await {
            debug!(target_path = %req.target_path, "target already mounted");
            return Ok(());
        }

        tokio::fs::create_dir_all(Path::new(&req.target_path))
            .await
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: e.to_string(),
            })?;

        let mut flags = MsFlags::MS_BIND;
        if req.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        nix::mount::mount(
            Some(req.staging_target_path.as_str()),
            req.target_path.as_str(),
            None::<&str>,
            flags,
            None::<&str>,
        )
        .map_err(|e| CsiError::MountFailed {
            path: req.target_path.clone(),
            reason: e.to_string(),
        })?;

        // MS_RDONLY is ignored on the initial bind; it only sticks on remount.
        if req.read_only {
            nix::mount::mount(
                None::<&str>,
                req.target_path.as_str(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: format!("remount read-only: {e}"),
            })?;
        }

        info!(target_path = %req.target_path, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if !is_mountpoint(target_path).await {
            debug!("target not mounted, nothing to unpublish");
            return Ok(());
        }

        nix::mount::umount(target_path).map_err(|e| CsiError::UnmountFailed {
            path: target_path.to_owned(),
            reason: e.to_string(),
        })?;

        info!(%target_path, "volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.instance_id().await?.to_owned(),
            max_volumes: self.attach_limit,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(TOPOLOGY_ZONE_KEY.to_owned(), self.zone.clone())]),
            }),
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }
}
