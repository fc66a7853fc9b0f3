//! Node mount orchestration: validates each request against mount-point
//! state and drives the selected backend.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{NODE_CAPABILITIES, S3Driver};
use crate::error::CsiError;
use crate::node::CsiNode;
use crate::s3::{BucketMetadata, S3Config};
use crate::types::*;

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        Err(CsiError::invalid(format!("{what} missing in request")))
    } else {
        Ok(())
    }
}

/// Create `path` (and parents) if absent.  An existing directory is fine.
async fn ensure_dir(path: &str) -> Result<(), CsiError> {
    tokio::fs::create_dir_all(Path::new(path))
        .await
        .map_err(|e| CsiError::internal(format!("unable to create directory {path}: {e}")))
}

impl S3Driver {
    /// Fetch the bucket metadata for a node request.
    async fn node_metadata(&self, s3: &S3Config) -> Result<BucketMetadata, CsiError> {
        let store = self.bucket_store(s3)?;
        store.get_metadata().await.map_err(|e| {
            CsiError::internal(format!("failed to get metadata of bucket {}: {e}", s3.bucket))
        })
    }
}

#[async_trait]
impl CsiNode for S3Driver {
    #[instrument(skip_all, fields(volume_id = %req.volume_id, path = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        let s3 = S3Config::from_secrets(&req.secrets);
        require(req.volume_id.as_str(), "volume ID")?;
        require(&s3.bucket, "bucket")?;
        require(&req.staging_target_path, "staging target path")?;
        if req.volume_capability.is_none() {
            return Err(CsiError::invalid("volume capability missing in request"));
        }

        ensure_dir(&req.staging_target_path).await?;
        let metadata = self.node_metadata(&s3).await?;
        let mounter = self.build_mounter(&s3, &metadata);
        mounter.stage(&req.staging_target_path).await?;

        info!(bucket = %s3.bucket, mounter = %mounter.kind(), "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require(volume_id.as_str(), "volume ID")?;
        require(staging_target_path, "staging target path")?;
        // No secrets, so no mounter to call; no backend stages anything.
        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        let s3 = S3Config::from_secrets(&req.secrets);
        if req.volume_capability.is_none() {
            return Err(CsiError::invalid("volume capability missing in request"));
        }
        require(req.volume_id.as_str(), "volume ID")?;
        require(&s3.bucket, "bucket")?;
        require(&req.staging_target_path, "staging target path")?;
        require(&req.target_path, "target path")?;

        ensure_dir(&req.target_path).await?;
        if self.supervisor.mounts().is_mount_point(&req.target_path).await {
            debug!("target already mounted, assuming idempotent retry");
            return Ok(());
        }

        let metadata = self.node_metadata(&s3).await?;
        let mounter = self.build_mounter(&s3, &metadata);
        mounter
            .mount(&req.staging_target_path, &req.target_path)
            .await?;

        info!(
            bucket = %s3.bucket,
            mounter = %mounter.kind(),
            read_only = req.read_only,
            "volume published",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require(volume_id.as_str(), "volume ID")?;
        require(target_path, "target path")?;

        if !self.supervisor.mounts().is_mount_point(target_path).await {
            debug!("target not mounted, cleaning up helper process only");
        }
        self.supervisor.unmount(target_path).await?;

        info!("volume unpublished");
        Ok(())
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, path = %req.volume_path))]
    async fn get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, CsiError> {
        require(req.volume_id.as_str(), "volume ID")?;
        require(&req.volume_path, "volume path")?;

        if !self.supervisor.mounts().is_mount_point(&req.volume_path).await {
            return Err(CsiError::NotFound(format!(
                "volume path {} is not mounted",
                req.volume_path
            )));
        }

        let path = req.volume_path.clone();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(path.as_str()))
            .await
            .map_err(CsiError::internal)?;
        let stat = match stat {
            Ok(stat) => stat,
            Err(e) => {
                warn!(error = %e, "statvfs failed");
                return Ok(VolumeStats {
                    usage: Vec::new(),
                    condition: VolumeCondition {
                        abnormal: true,
                        message: format!("statvfs {}: {e}", req.volume_path),
                    },
                });
            }
        };

        let block = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * block;
        let available = stat.blocks_available() as u64 * block;
        let free = stat.blocks_free() as u64 * block;
        let inodes = stat.files() as u64;
        let inodes_free = stat.files_free() as u64;

        Ok(VolumeStats {
            usage: vec![
                VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total,
                    available,
                    used: total.saturating_sub(free),
                },
                VolumeUsage {
                    unit: UsageUnit::Inodes,
                    total: inodes,
                    available: inodes_free,
                    used: inodes.saturating_sub(inodes_free),
                },
            ],
            condition: VolumeCondition::default(),
        })
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(NODE_CAPABILITIES.to_vec())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes: 0,
        })
    }
}
