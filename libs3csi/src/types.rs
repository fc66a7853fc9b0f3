//! Core CSI types: volumes, capabilities, requests, and responses.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and the S3 backend.  They are all [`Serialize`]/[`Deserialize`] so they
//! can be transmitted over QUIC as JSON.
//!
//! Requests that reach the object store carry a `secrets` map with the
//! connection credentials.  Those maps must never be logged; the
//! [`Display`](fmt::Display) impls in [`crate::message`] only print ids.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Per-call connection secrets (`accessKeyID`, `secretAccessKey`, `region`,
/// `endpoint`, `bucket`, `mounter`).
pub type Secrets = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.  Maps 1:1 to a bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed, following the CSI access modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type reported to the orchestrator.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
}

fn default_fs_type() -> String {
    "fuse".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            mount_flags: Vec::new(),
            fs_type: default_fs_type(),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume descriptors
// ---------------------------------------------------------------------------

/// Descriptor of a provisioned volume, as returned to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Non-sensitive context echoed to subsequent Node operations
    /// (`mounter`, `bucket`, `prefix`).
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Health of a volume as seen by the controller or node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCondition {
    pub abnormal: bool,
    #[serde(default)]
    pub message: String,
}

/// Result of `ControllerGetVolume`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerVolume {
    pub volume: Volume,
    pub condition: VolumeCondition,
}

// ---------------------------------------------------------------------------
// Controller requests & responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Volume name; becomes the volume id.
    pub name: String,
    /// Required capacity in bytes.  Zero means "not specified".
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters, echoed back as the volume context.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to delete a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to validate capabilities against an existing volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub secrets: Secrets,
}

/// Outcome of a capability validation.  An unconfirmed result is not an
/// error; `message` explains why.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub confirmed: Option<Vec<VolumeCapability>>,
    #[serde(default)]
    pub message: String,
}

/// Request to page through the volumes provisioned by this driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Decimal offset into the registry scan; empty means `"0"`.
    #[serde(default)]
    pub starting_token: String,
    #[serde(default)]
    pub secrets: Secrets,
}

/// One page of volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListVolumesResponse {
    pub entries: Vec<Volume>,
    /// Token for the next page; empty once the listing is exhausted.
    pub next_token: String,
}

/// Capacity information reported by `GetCapacity`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityInfo {
    /// `None` when the backend has no meaningful upper bound.
    pub available_capacity: Option<u64>,
    pub minimum_volume_size: u64,
    pub maximum_volume_size: Option<u64>,
}

/// RPCs a controller may advertise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    CreateDeleteSnapshot,
    ExpandVolume,
    GetVolume,
    VolumeCondition,
    ModifyVolume,
}

impl fmt::Display for ControllerCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateDeleteVolume => "CREATE_DELETE_VOLUME",
            Self::PublishUnpublishVolume => "PUBLISH_UNPUBLISH_VOLUME",
            Self::ListVolumes => "LIST_VOLUMES",
            Self::GetCapacity => "GET_CAPACITY",
            Self::CreateDeleteSnapshot => "CREATE_DELETE_SNAPSHOT",
            Self::ExpandVolume => "EXPAND_VOLUME",
            Self::GetVolume => "GET_VOLUME",
            Self::VolumeCondition => "VOLUME_CONDITION",
            Self::ModifyVolume => "MODIFY_VOLUME",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Node requests & responses
// ---------------------------------------------------------------------------

/// Request to stage a volume on a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging path,
    /// e.g. `/var/lib/rkl/volumes/<vol-id>/globalmount`.
    pub staging_target_path: String,
    /// Requested capability.  Required.
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to publish a staged volume at the workload-visible path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging path.
    pub staging_target_path: String,
    /// Target path inside the pod,
    /// e.g. `/var/lib/rkl/pods/<pod-uid>/volumes/<vol-name>`.
    pub target_path: String,
    /// Requested capability.  Required.
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request for usage statistics of a published volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: VolumeId,
    pub volume_path: String,
    #[serde(default)]
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub unit: UsageUnit,
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

/// Result of `NodeGetVolumeStats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub usage: Vec<VolumeUsage>,
    pub condition: VolumeCondition,
}

/// RPCs a node service may advertise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
    VolumeCondition,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.s3.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host; zero means no limit.
    pub max_volumes: u64,
}
