//! Cloud API seams: block storage (CBS), compute instances (CVM) and the
//! resource tagging service.
//!
//! The controller endpoint and the tag reconciler both hold the same
//! [`CloudClients`] bundle; every client must tolerate concurrent calls.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudError;

pub use http::HttpCloudClient;

/// Tag key carrying the owning cluster's id.
pub const CLUSTER_TAG_KEY: &str = "tke-clusterId";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A cloud block-storage disk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disk {
    pub disk_id: String,
    pub disk_name: String,
    pub size_gb: u64,
    pub zone: String,
    /// Instance the disk is attached to, if any.
    pub instance_id: Option<String>,
    pub tags: Vec<Tag>,
}

impl Disk {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// A compute instance, as far as tag reconciliation cares.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instance {
    pub instance_id: String,
    pub tags: Vec<Tag>,
}

impl Instance {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// Parameters for a new disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDiskSpec {
    pub name: String,
    pub size_gb: u64,
    pub zone: String,
    pub disk_type: String,
    pub tags: Vec<Tag>,
}

/// Six-segment resource name of a disk, as the tagging service expects it.
pub fn volume_resource(region: &str, disk_id: &str) -> String {
    format!("qcs::cvm:{region}::volume/{disk_id}")
}

#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Describe the given disks.  Unknown ids are silently absent.
    async fn describe_disks(&self, disk_ids: &[String]) -> Result<Vec<Disk>, CloudError>;

    async fn find_disk_by_name(&self, name: &str) -> Result<Option<Disk>, CloudError>;

    /// Create one disk and return its id.
    async fn create_disk(&self, spec: &CreateDiskSpec) -> Result<String, CloudError>;

    async fn delete_disk(&self, disk_id: &str) -> Result<(), CloudError>;

    async fn attach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), CloudError>;

    async fn detach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait Instances: Send + Sync {
    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<Instance>, CloudError>;
}

#[async_trait]
pub trait Tags: Send + Sync {
    /// Replace (or add) the given tags on one resource.
    async fn modify_resource_tags(&self, resource: &str, replace: &[Tag]) -> Result<(), CloudError>;
}

/// Shared, read-only client handles.
#[derive(Clone)]
pub struct CloudClients {
    pub cbs: Arc<dyn BlockStorage>,
    pub cvm: Arc<dyn Instances>,
    pub tag: Arc<dyn Tags>,
}

impl CloudClients {
    /// One HTTP client serving all three APIs.
    pub fn http(cbs_url: &str, region: &str) -> Result<Self, CloudError> {
        let client = Arc::new(HttpCloudClient::new(cbs_url, region)?);
        Ok(Self {
            cbs: client.clone(),
            cvm: client.clone(),
            tag: client,
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory cloud used by controller, reconciler and driver tests.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeCloud {
        pub disks: Mutex<BTreeMap<String, Disk>>,
        pub instances: Mutex<BTreeMap<String, Instance>>,
        /// `(resource, tags)` for every modify call, in order.
        pub tag_calls: Mutex<Vec<(String, Vec<Tag>)>>,
        /// Resources whose tag update is rejected.
        pub failing_resources: Mutex<Vec<String>>,
        pub fail_describe: Mutex<bool>,
        pub describe_batches: Mutex<Vec<usize>>,
        pub instance_batches: Mutex<Vec<usize>>,
        pub next_id: Mutex<u32>,
    }

    impl FakeCloud {
        pub(crate) fn clients(self: &Arc<Self>) -> CloudClients {
            CloudClients {
                cbs: self.clone(),
                cvm: self.clone(),
                tag: self.clone(),
            }
        }

        pub(crate) fn add_disk(&self, disk: Disk) {
            self.disks
                .lock()
                .unwrap()
                .insert(disk.disk_id.clone(), disk);
        }

        pub(crate) fn add_instance(&self, instance: Instance) {
            self.instances
                .lock()
                .unwrap()
                .insert(instance.instance_id.clone(), instance);
        }

        fn api_error(action: &'static str, message: &str) -> CloudError {
            CloudError::Api {
                action,
                code: "InvalidParameter".into(),
                message: message.into(),
            }
        }
    }

    #[async_trait]
    impl BlockStorage for FakeCloud {
        async fn describe_disks(&self, disk_ids: &[String]) -> Result<Vec<Disk>, CloudError> {
            if *self.fail_describe.lock().unwrap() {
                return Err(CloudError::Request {
                    action: "DescribeDisks",
                    reason: "connection reset".into(),
                });
            }
            self.describe_batches.lock().unwrap().push(disk_ids.len());
            let disks = self.disks.lock().unwrap();
            Ok(disk_ids
                .iter()
                .filter_map(|id| disks.get(id).cloned())
                .collect())
        }

        async fn find_disk_by_name(&self, name: &str) -> Result<Option<Disk>, CloudError> {
            Ok(self
                .disks
                .lock()
                .unwrap()
                .values()
                .find(|d| d.disk_name == name)
                .cloned())
        }

        async fn create_disk(&self, spec: &CreateDiskSpec) -> Result<String, CloudError> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let disk_id = format!("disk-{:08}", *next);
            self.add_disk(Disk {
                disk_id: disk_id.clone(),
                disk_name: spec.name.clone(),
                size_gb: spec.size_gb,
                zone: spec.zone.clone(),
                instance_id: None,
                tags: spec.tags.clone(),
            });
            Ok(disk_id)
        }

        async fn delete_disk(&self, disk_id: &str) -> Result<(), CloudError> {
            self.disks
                .lock()
                .unwrap()
                .remove(disk_id)
                .map(|_| ())
                .ok_or_else(|| Self::api_error("TerminateDisks", "disk not found"))
        }

        async fn attach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), CloudError> {
            let mut disks = self.disks.lock().unwrap();
            let disk = disks
                .get_mut(disk_id)
                .ok_or_else(|| Self::api_error("AttachDisks", "disk not found"))?;
            disk.instance_id = Some(instance_id.to_owned());
            Ok(())
        }

        async fn detach_disk(&self, disk_id: &str, _instance_id: &str) -> Result<(), CloudError> {
            let mut disks = self.disks.lock().unwrap();
            let disk = disks
                .get_mut(disk_id)
                .ok_or_else(|| Self::api_error("DetachDisks", "disk not found"))?;
            disk.instance_id = None;
            Ok(())
        }
    }

    #[async_trait]
    impl Instances for FakeCloud {
        async fn describe_instances(
            &self,
            instance_ids: &[String],
        ) -> Result<Vec<Instance>, CloudError> {
            self.instance_batches
                .lock()
                .unwrap()
                .push(instance_ids.len());
            let instances = self.instances.lock().unwrap();
            Ok(instance_ids
                .iter()
                .filter_map(|id| instances.get(id).cloned())
                .collect())
        }
    }

    #[async_trait]
    impl Tags for FakeCloud {
        async fn modify_resource_tags(
            &self,
            resource: &str,
            replace: &[Tag],
        ) -> Result<(), CloudError> {
            self.tag_calls
                .lock()
                .unwrap()
                .push((resource.to_owned(), replace.to_vec()));
            let failing = self.failing_resources.lock().unwrap();
            if failing.iter().any(|r| r == resource) {
                return Err(Self::api_error("ModifyResourceTags", "resource locked"));
            }
            Ok(())
        }
    }
}
