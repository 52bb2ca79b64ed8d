//! Identity endpoint.

use async_trait::async_trait;
use libcsi::{CsiError, CsiIdentity, PluginCapability, PluginInfo};

use crate::config::{DRIVER_NAME, DRIVER_VERSION};

/// Stateless plugin identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct CbsIdentity;

impl CbsIdentity {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CsiIdentity for CbsIdentity {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: DRIVER_NAME.to_owned(),
            vendor_version: DRIVER_VERSION.to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }
}
