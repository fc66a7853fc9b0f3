//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local filesystem
//! operations required to make a volume available to Pod containers:
//!
//! 1. **Stage**: prepare the volume at a global per-node path.
//! 2. **Publish**: mount the bucket at the Pod's target path.
//! 3. **Unpublish**: unmount the target and reap the FUSE helper.
//! 4. **Unstage**: undo staging.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeGetVolumeStatsRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, VolumeId, VolumeStats,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the global staging path.
    ///
    /// This is idempotent: calling it again for an already-staged volume
    /// should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Undo [`Self::stage_volume`].  Idempotent.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume at the workload-visible target path.
    ///
    /// This is idempotent: calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unmount the target path.  Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    async fn get_volume_stats(
        &self,
        _req: NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, CsiError> {
        Err(CsiError::unimplemented("NodeGetVolumeStats"))
    }

    async fn node_expand_volume(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
        _capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("NodeExpandVolume"))
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
