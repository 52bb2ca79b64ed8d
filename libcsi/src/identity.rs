//! CSI Identity service trait.
//!
//! Orchestrator sidecars call Identity first: to learn the driver name they
//! must register under, to poll readiness, and to decide whether a
//! Controller service and topology-aware provisioning are available.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Driver name and vendor version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// `true` once the plugin can serve requests.
    async fn probe(&self) -> Result<bool, CsiError>;

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
