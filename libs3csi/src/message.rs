//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the CSI client (control plane or kubelet side)
//! and the CSI server (driver side) via QUIC bi-directional streams.
//!
//! Requests carry per-call secrets.  The [`Display`](std::fmt::Display) impl
//! prints identifiers only, so messages can be logged as-is.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity requests -----------------------------------------------
    GetPluginInfo,
    GetPluginCapabilities,
    Probe,

    // ----- Controller requests ---------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ListVolumes(ListVolumesRequest),
    GetCapacity,
    ControllerGetCapabilities,
    ControllerGetVolume(VolumeId),
    ControllerPublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    ControllerUnpublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    CreateSnapshot {
        source_volume_id: VolumeId,
        name: String,
    },
    DeleteSnapshot(String),
    ListSnapshots,
    ControllerExpandVolume {
        volume_id: VolumeId,
        capacity_bytes: u64,
    },
    ControllerModifyVolume(VolumeId),

    // ----- Node requests ---------------------------------------------------
    StageVolume(NodeStageVolumeRequest),
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    PublishVolume(NodePublishVolumeRequest),
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    GetVolumeStats(NodeGetVolumeStatsRequest),
    NodeExpandVolume {
        volume_id: VolumeId,
        volume_path: String,
        capacity_bytes: u64,
    },
    NodeGetCapabilities,
    GetNodeInfo,

    // ----- Responses -------------------------------------------------------
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    ProbeResult(bool),
    VolumeCreated(Volume),
    Validation(ValidationResult),
    VolumeList(ListVolumesResponse),
    Capacity(CapacityInfo),
    ControllerCapabilities(Vec<ControllerCapability>),
    VolumeInfo(ControllerVolume),
    /// New capacity after an expansion.
    Expanded(u64),
    Stats(VolumeStats),
    NodeCapabilities(Vec<NodeCapability>),
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::Probe => f.write_str("Probe"),

            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(req) => write!(f, "DeleteVolume({})", req.volume_id),
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::ListVolumes(req) => write!(f, "ListVolumes(token={})", req.starting_token),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::ControllerGetVolume(id) => write!(f, "ControllerGetVolume({id})"),
            Self::ControllerPublishVolume { volume_id, node_id } => {
                write!(f, "ControllerPublishVolume({volume_id}, node={node_id})")
            }
            Self::ControllerUnpublishVolume { volume_id, node_id } => {
                write!(f, "ControllerUnpublishVolume({volume_id}, node={node_id})")
            }
            Self::CreateSnapshot { name, .. } => write!(f, "CreateSnapshot({name})"),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({id})"),
            Self::ListSnapshots => f.write_str("ListSnapshots"),
            Self::ControllerExpandVolume { volume_id, .. } => {
                write!(f, "ControllerExpandVolume({volume_id})")
            }
            Self::ControllerModifyVolume(id) => write!(f, "ControllerModifyVolume({id})"),

            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({volume_id})"),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({volume_id})")
            }
            Self::GetVolumeStats(req) => write!(f, "GetVolumeStats({})", req.volume_id),
            Self::NodeExpandVolume { volume_id, .. } => write!(f, "NodeExpandVolume({volume_id})"),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),

            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::Validation(r) => write!(f, "Validation(confirmed={})", r.confirmed.is_some()),
            Self::VolumeList(page) => write!(
                f,
                "VolumeList(count={}, next={})",
                page.entries.len(),
                page.next_token
            ),
            Self::Capacity(c) => write!(f, "Capacity(min={})", c.minimum_volume_size),
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::VolumeInfo(v) => write!(f, "VolumeInfo({})", v.volume.volume_id),
            Self::Expanded(bytes) => write!(f, "Expanded({bytes})"),
            Self::Stats(s) => write!(f, "Stats(abnormal={})", s.condition.abnormal),
            Self::NodeCapabilities(caps) => write!(f, "NodeCapabilities(count={})", caps.len()),
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
