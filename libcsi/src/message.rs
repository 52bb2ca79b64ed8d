//! CSI protocol messages carried over the unix-socket transport.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between a CSI client (the orchestrator side) and the
//! CSI server (the driver).  Each frame on the socket carries exactly one
//! JSON-encoded message.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope.
///
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Health check (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    /// Create a new volume (Controller).
    CreateVolume(CreateVolumeRequest),
    /// Delete a volume (Controller).
    DeleteVolume(VolumeId),
    /// Attach a volume to a node (Controller).
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    /// Detach a volume from a node (Controller).
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    /// Validate volume capabilities (Controller).
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    /// List all known volumes (Controller).
    ListVolumes,
    /// Query remaining capacity (Controller).
    GetCapacity,
    /// Query controller capabilities (Controller).
    ControllerGetCapabilities,

    /// Stage (mount) a volume at a global path (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Unstage a previously staged volume (Node).
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Publish (bind-mount) a staged volume into a Pod (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Unpublish a previously published volume (Node).
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    /// Query node info (Node).
    GetNodeInfo,
    /// Query node capabilities (Node).
    NodeGetCapabilities,

    // ----- Responses -------------------------------------------------------
    /// A volume was successfully created.
    VolumeCreated(Volume),
    /// A volume was attached; the context is forwarded to the Node service.
    VolumePublished(PublishContext),
    /// A list of volumes.
    VolumeList(Vec<Volume>),
    /// Available capacity in bytes.
    Capacity(u64),
    /// Whether the requested capabilities are valid.
    CapabilitiesValid(bool),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Controller capabilities.
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    /// Node capabilities.
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    /// Fully qualified CSI method name for request variants, `None` for
    /// responses.
    pub fn method(&self) -> Option<&'static str> {
        let name = match self {
            Self::Probe => "/csi.v1.Identity/Probe",
            Self::GetPluginInfo => "/csi.v1.Identity/GetPluginInfo",
            Self::GetPluginCapabilities => "/csi.v1.Identity/GetPluginCapabilities",
            Self::CreateVolume(_) => "/csi.v1.Controller/CreateVolume",
            Self::DeleteVolume(_) => "/csi.v1.Controller/DeleteVolume",
            Self::ControllerPublishVolume(_) => "/csi.v1.Controller/ControllerPublishVolume",
            Self::ControllerUnpublishVolume(_) => "/csi.v1.Controller/ControllerUnpublishVolume",
            Self::ValidateVolumeCapabilities { .. } => {
                "/csi.v1.Controller/ValidateVolumeCapabilities"
            }
            Self::ListVolumes => "/csi.v1.Controller/ListVolumes",
            Self::GetCapacity => "/csi.v1.Controller/GetCapacity",
            Self::ControllerGetCapabilities => "/csi.v1.Controller/ControllerGetCapabilities",
            Self::StageVolume(_) => "/csi.v1.Node/NodeStageVolume",
            Self::UnstageVolume { .. } => "/csi.v1.Node/NodeUnstageVolume",
            Self::PublishVolume(_) => "/csi.v1.Node/NodePublishVolume",
            Self::UnpublishVolume { .. } => "/csi.v1.Node/NodeUnpublishVolume",
            Self::GetNodeInfo => "/csi.v1.Node/NodeGetInfo",
            Self::NodeGetCapabilities => "/csi.v1.Node/NodeGetCapabilities",
            _ => return None,
        };
        Some(name)
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({})", id),
            Self::ControllerPublishVolume(req) => {
                let (volume, node) = (&req.volume_id, &req.node_id);
                write!(f, "ControllerPublishVolume({volume} -> {node})")
            }
            Self::ControllerUnpublishVolume(req) => {
                let (volume, node) = (&req.volume_id, &req.node_id);
                write!(f, "ControllerUnpublishVolume({volume} -/> {node})")
            }
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({})", volume_id)
            }
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({})", volume_id)
            }
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumePublished(ctx) => write!(f, "VolumePublished(keys={})", ctx.len()),
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::Capacity(c) => write!(f, "Capacity({})", c),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({})", v),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Error(e) => write!(f, "Error({})", e),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::ListVolumes => f.write_str("ListVolumes"),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
        }
    }
}
