//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: creation,
//! deletion, capability validation, listing, and capacity queries.  It runs
//! once per cluster, next to the orchestrator's control plane.
//!
//! Only the lifecycle RPCs are required.  Every optional RPC has a default
//! body returning [`CsiError::Unimplemented`] naming the call, so a driver
//! overrides exactly what it supports.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    CapacityInfo, ControllerCapability, ControllerVolume, CreateVolumeRequest,
    DeleteVolumeRequest, ListVolumesRequest, ListVolumesResponse, NodeInfo,
    ValidateVolumeCapabilitiesRequest, ValidationResult, Volume, VolumeId,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume, or return the existing one when the request
    /// matches it.
    ///
    /// The returned [`Volume`] carries the `volume_context` that must be
    /// forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Deleting a volume that is
    /// already gone succeeds.
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidationResult, CsiError>;

    /// Page through the volumes provisioned by this driver.
    async fn list_volumes(&self, req: ListVolumesRequest)
    -> Result<ListVolumesResponse, CsiError>;

    async fn get_capacity(&self) -> Result<CapacityInfo, CsiError>;

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    async fn controller_get_volume(
        &self,
        _volume_id: &VolumeId,
    ) -> Result<ControllerVolume, CsiError> {
        Err(CsiError::unimplemented("ControllerGetVolume"))
    }

    async fn controller_publish_volume(
        &self,
        _volume_id: &VolumeId,
        _node: &NodeInfo,
    ) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ControllerPublishVolume"))
    }

    async fn controller_unpublish_volume(
        &self,
        _volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ControllerUnpublishVolume"))
    }

    async fn create_snapshot(
        &self,
        _source_volume_id: &VolumeId,
        _name: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("CreateSnapshot"))
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("DeleteSnapshot"))
    }

    async fn list_snapshots(&self) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ListSnapshots"))
    }

    async fn controller_expand_volume(
        &self,
        _volume_id: &VolumeId,
        _capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("ControllerExpandVolume"))
    }

    async fn controller_modify_volume(&self, _volume_id: &VolumeId) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ControllerModifyVolume"))
    }
}
