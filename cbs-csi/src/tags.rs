//! Cluster tag reconciliation for provisioned disks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cloud::{CLUSTER_TAG_KEY, CloudClients, Disk, Tag, volume_resource};
use crate::cluster::ClusterClient;
use crate::config::DRIVER_NAME;
use crate::error::TagSyncError;

/// Ids sent per describe call, for disks and instances alike.
pub const DESCRIBE_BATCH: usize = 100;

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagSyncReport {
    pub examined: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// One reconciliation pass, as driven by the scheduler.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self) -> Result<TagSyncReport, TagSyncError>;
}

pub struct DiskTagReconciler {
    clients: CloudClients,
    cluster: Arc<dyn ClusterClient>,
    region: String,
    cluster_id: String,
}

impl DiskTagReconciler {
    pub fn new(
        clients: CloudClients,
        cluster: Arc<dyn ClusterClient>,
        region: impl Into<String>,
        cluster_id: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            cluster,
            region: region.into(),
            cluster_id: cluster_id.into(),
        }
    }

    async fn describe(&self, handles: &[String]) -> Result<Vec<Disk>, TagSyncError> {
        let mut disks = Vec::with_capacity(handles.len());
        for batch in handles.chunks(DESCRIBE_BATCH) {
            disks.extend(self.clients.cbs.describe_disks(batch).await?);
        }
        Ok(disks)
    }

    /// Cluster tag of every instance the disks are attached to.
    async fn instance_owners(
        &self,
        disks: &[Disk],
    ) -> Result<HashMap<String, String>, TagSyncError> {
        let ids: Vec<String> = disks
            .iter()
            .filter_map(|d| d.instance_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut owners = HashMap::new();
        for batch in ids.chunks(DESCRIBE_BATCH) {
            for instance in self.clients.cvm.describe_instances(batch).await? {
                if let Some(owner) = instance.tag(CLUSTER_TAG_KEY) {
                    let owner = owner.to_owned();
                    owners.insert(instance.instance_id, owner);
                }
            }
        }
        Ok(owners)
    }
}

#[async_trait]
impl Reconcile for DiskTagReconciler {
    async fn reconcile(&self) -> Result<TagSyncReport, TagSyncError> {
        let mut report = TagSyncReport::default();
        if self.cluster_id.is_empty() {
            warn!("cluster id is empty, skipping tag sync");
            return Ok(report);
        }

        let handles = self.cluster.list_volume_handles(DRIVER_NAME).await?;
        if handles.is_empty() {
            debug!("no volumes provisioned by this driver");
            return Ok(report);
        }

        let disks = self.describe(&handles).await?;
        let owners = self.instance_owners(&disks).await?;
        let wanted = [Tag::new(CLUSTER_TAG_KEY, self.cluster_id.clone())];

        for disk in &disks {
            report.examined += 1;

            let foreign = disk
                .instance_id
                .as_ref()
                .and_then(|id| owners.get(id))
                .is_some_and(|owner| !owner.is_empty() && *owner != self.cluster_id);
            if foreign || disk.tag(CLUSTER_TAG_KEY) == Some(self.cluster_id.as_str()) {
                report.skipped += 1;
                continue;
            }

            let resource = volume_resource(&self.region, &disk.disk_id);
            let tags = &self.clients.tag;
            match tags.modify_resource_tags(&resource, &wanted).await {
                Ok(()) => {
                    debug!(disk_id = %disk.disk_id, "cluster tag written");
                    report.updated += 1;
                }
                Err(e) => {
                    warn!(disk_id = %disk.disk_id, error = %e, "failed to tag disk");
                    report.failed += 1;
                }
            }
        }

        info!(
            cluster_id = %self.cluster_id,
            examined = report.examined,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "tag sync pass finished",
        );
        Ok(report)
    }
}
