//! JSON-over-HTTPS client for the CBS, CVM and tag APIs.
//!
//! Every call is a `POST /` to the service domain with the action, version
//! and region in `X-TC-*` headers and the parameters as a JSON body.  The
//! reply is wrapped in a `Response` object that either carries the result
//! fields or an `Error`.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{BlockStorage, CreateDiskSpec, Disk, Instance, Instances, Tag, Tags};
use crate::error::CloudError;

const CBS_VERSION: &str = "2017-03-12";
const CVM_VERSION: &str = "2017-03-12";
const TAG_VERSION: &str = "2018-08-13";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpCloudClient {
    http: reqwest::Client,
    region: String,
    cbs_domain: String,
    cvm_domain: String,
    tag_domain: String,
}

/// Derive a sibling service domain: `cbs.internal.x.com` → `cvm.internal.x.com`.
fn sibling_domain(cbs_domain: &str, service: &str) -> String {
    match cbs_domain.strip_prefix("cbs.") {
        Some(rest) => format!("{service}.{rest}"),
        None => cbs_domain.to_owned(),
    }
}

impl HttpCloudClient {
    pub fn new(cbs_url: &str, region: &str) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::Build(e.to_string()))?;
        let cbs_domain = cbs_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_owned();
        Ok(Self {
            http,
            region: region.to_owned(),
            cvm_domain: sibling_domain(&cbs_domain, "cvm"),
            tag_domain: sibling_domain(&cbs_domain, "tag"),
            cbs_domain,
        })
    }

    async fn call<P, R>(
        &self,
        domain: &str,
        version: &'static str,
        action: &'static str,
        params: &P,
    ) -> Result<R, CloudError>
    where
        P: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let request_failed = |reason: String| CloudError::Request { action, reason };

        let resp = self
            .http
            .post(format!("https://{domain}/"))
            .header("X-TC-Action", action)
            .header("X-TC-Version", version)
            .header("X-TC-Region", &self.region)
            .json(params)
            .send()
            .await
            .map_err(|e| request_failed(e.to_string()))?;

        let status = resp.status();
        let body: Envelope<R> = resp
            .json()
            .await
            .map_err(|e| request_failed(format!("HTTP {status}: {e}")))?;

        let response = body.response;
        if let Some(err) = response.error {
            return Err(CloudError::Api {
                action,
                code: err.code,
                message: err.message,
            });
        }
        let result = response
            .result
            .ok_or_else(|| request_failed("empty response".into()))?;
        debug!(action, request_id = ?response.request_id, "cloud api call succeeded");
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope<R> {
    #[serde(rename = "Response")]
    response: ResponseBody<R>,
}

#[derive(Deserialize)]
struct ResponseBody<R> {
    #[serde(rename = "Error")]
    error: Option<ApiError>,
    #[serde(rename = "RequestId")]
    request_id: Option<String>,
    #[serde(flatten)]
    result: Option<R>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct WireTag {
    key: String,
    value: String,
}

impl From<WireTag> for Tag {
    fn from(t: WireTag) -> Self {
        Tag::new(t.key, t.value)
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct WirePlacement {
    #[serde(default)]
    zone: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireDisk {
    disk_id: String,
    #[serde(default)]
    disk_name: String,
    #[serde(default)]
    disk_size: u64,
    #[serde(default)]
    placement: WirePlacement,
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    attached: bool,
    #[serde(default)]
    tags: Vec<WireTag>,
}

impl From<WireDisk> for Disk {
    fn from(d: WireDisk) -> Self {
        let attached = d.attached && !d.instance_id.is_empty();
        Disk {
            disk_id: d.disk_id,
            disk_name: d.disk_name,
            size_gb: d.disk_size,
            zone: d.placement.zone,
            instance_id: attached.then_some(d.instance_id),
            tags: d.tags.into_iter().map(Tag::from).collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Filter<'a> {
    name: &'a str,
    values: Vec<&'a str>,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "PascalCase")]
struct DescribeDisksParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filters: Vec<Filter<'a>>,
    limit: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDisksResult {
    #[serde(default)]
    disk_set: Vec<WireDisk>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateDisksParams<'a> {
    disk_type: &'a str,
    disk_charge_type: &'static str,
    placement: CreatePlacement<'a>,
    disk_name: &'a str,
    disk_size: u64,
    disk_count: u32,
    tags: Vec<WireTag>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreatePlacement<'a> {
    zone: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateDisksResult {
    #[serde(default)]
    disk_id_set: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DiskIdsParams<'a> {
    disk_ids: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct Empty {}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesParams<'a> {
    instance_ids: &'a [String],
    limit: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResult {
    #[serde(default)]
    instance_set: Vec<WireInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireInstance {
    instance_id: String,
    #[serde(default)]
    tags: Vec<WireTag>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ModifyResourceTagsParams<'a> {
    resource: &'a str,
    replace_tags: Vec<ReplaceTag<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReplaceTag<'a> {
    tag_key: &'a str,
    tag_value: &'a str,
}

// ---------------------------------------------------------------------------
// Trait impls
// ---------------------------------------------------------------------------

#[async_trait]
impl BlockStorage for HttpCloudClient {
    #[instrument(skip(self), fields(count = disk_ids.len()))]
    async fn describe_disks(&self, disk_ids: &[String]) -> Result<Vec<Disk>, CloudError> {
        if disk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = DescribeDisksParams {
            disk_ids: Some(disk_ids),
            limit: disk_ids.len(),
            ..Default::default()
        };
        let result: DescribeDisksResult = self
            .call(&self.cbs_domain, CBS_VERSION, "DescribeDisks", &params)
            .await?;
        Ok(result.disk_set.into_iter().map(Disk::from).collect())
    }

    async fn find_disk_by_name(&self, name: &str) -> Result<Option<Disk>, CloudError> {
        let params = DescribeDisksParams {
            disk_ids: None,
            filters: vec![Filter {
                name: "disk-name",
                values: vec![name],
            }],
            limit: 1,
        };
        let result: DescribeDisksResult = self
            .call(&self.cbs_domain, CBS_VERSION, "DescribeDisks", &params)
            .await?;
        Ok(result.disk_set.into_iter().next().map(Disk::from))
    }

    #[instrument(skip(self), fields(name = %spec.name))]
    async fn create_disk(&self, spec: &CreateDiskSpec) -> Result<String, CloudError> {
        let params = CreateDisksParams {
            disk_type: &spec.disk_type,
            disk_charge_type: "POSTPAID_BY_HOUR",
            placement: CreatePlacement { zone: &spec.zone },
            disk_name: &spec.name,
            disk_size: spec.size_gb,
            disk_count: 1,
            tags: spec
                .tags
                .iter()
                .map(|t| WireTag {
                    key: t.key.clone(),
                    value: t.value.clone(),
                })
                .collect(),
        };
        let result: CreateDisksResult = self
            .call(&self.cbs_domain, CBS_VERSION, "CreateDisks", &params)
            .await?;
        result
            .disk_id_set
            .into_iter()
            .next()
            .ok_or(CloudError::Request {
                action: "CreateDisks",
                reason: "no disk id returned".into(),
            })
    }

    async fn delete_disk(&self, disk_id: &str) -> Result<(), CloudError> {
        let params = DiskIdsParams {
            disk_ids: [disk_id],
            instance_id: None,
        };
        let _: Empty = self
            .call(&self.cbs_domain, CBS_VERSION, "TerminateDisks", &params)
            .await?;
        Ok(())
    }

    async fn attach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), CloudError> {
        let params = DiskIdsParams {
            disk_ids: [disk_id],
            instance_id: Some(instance_id),
        };
        let _: Empty = self
            .call(&self.cbs_domain, CBS_VERSION, "AttachDisks", &params)
            .await?;
        Ok(())
    }

    async fn detach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), CloudError> {
        let params = DiskIdsParams {
            disk_ids: [disk_id],
            instance_id: (!instance_id.is_empty()).then_some(instance_id),
        };
        let _: Empty = self
            .call(&self.cbs_domain, CBS_VERSION, "DetachDisks", &params)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Instances for HttpCloudClient {
    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<Instance>, CloudError> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = DescribeInstancesParams {
            instance_ids,
            limit: instance_ids.len(),
        };
        let result: DescribeInstancesResult = self
            .call(&self.cvm_domain, CVM_VERSION, "DescribeInstances", &params)
            .await?;
        Ok(result
            .instance_set
            .into_iter()
            .map(|i| Instance {
                instance_id: i.instance_id,
                tags: i.tags.into_iter().map(Tag::from).collect(),
            })
            .collect())
    }
}

#[async_trait]
impl Tags for HttpCloudClient {
    async fn modify_resource_tags(
        &self,
        resource: &str,
        replace: &[Tag],
    ) -> Result<(), CloudError> {
        let params = ModifyResourceTagsParams {
            resource,
            replace_tags: replace
                .iter()
                .map(|t| ReplaceTag {
                    tag_key: &t.key,
                    tag_value: &t.value,
                })
                .collect(),
        };
        let _: Empty = self
            .call(&self.tag_domain, TAG_VERSION, "ModifyResourceTags", &params)
            .await?;
        Ok(())
    }
}
