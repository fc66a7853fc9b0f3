//! Volume lifecycle: reconciles the persistent-volume registry with bucket
//! state to decide create / reuse / conflict.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::{CONTROLLER_CAPABILITIES, S3Driver};
use crate::config::{BUCKET_KEY, DEFAULT_CAPACITY_BYTES, DeletePolicy, MOUNTER_KEY, PREFIX_KEY};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::registry::{PersistentVolume, VolumePhase};
use crate::s3::{BucketMetadata, FS_PATH_PREFIX, S3Config};
use crate::types::*;

/// Context echoed back to the node for a volume.
fn volume_context(
    parameters: &HashMap<String, String>,
    bucket: &str,
    mounter: &str,
) -> HashMap<String, String> {
    let mut context = parameters.clone();
    context.insert(BUCKET_KEY.to_owned(), bucket.to_owned());
    context.insert(MOUNTER_KEY.to_owned(), mounter.to_owned());
    context.insert(PREFIX_KEY.to_owned(), FS_PATH_PREFIX.to_owned());
    context
}

fn descriptor(pv: &PersistentVolume) -> Volume {
    Volume {
        volume_id: VolumeId(pv.name.clone()),
        capacity_bytes: pv.capacity_bytes,
        volume_context: pv.volume_attributes.clone(),
    }
}

impl S3Driver {
    /// `Some(pv)` when the registry has a volume of that name.  Registry
    /// failures are `Internal`.
    async fn lookup_volume(&self, name: &str) -> Result<Option<PersistentVolume>, CsiError> {
        self.registry.get(name).await.map_err(|e| {
            CsiError::internal(format!("failed to fetch persistent volume {name}: {e}"))
        })
    }

    /// Empty the bucket of a deleted volume.  On failure the metadata is
    /// written back so the bucket stays recognisable as a driver volume.
    async fn purge_bucket(
        &self,
        s3: &S3Config,
        metadata: &BucketMetadata,
    ) -> Result<(), CsiError> {
        let store = self.bucket_store(s3)?;
        if let Err(e) = store.remove_bucket().await {
            warn!(
                bucket = %s3.bucket,
                error = %e,
                "bucket removal failed, restoring metadata to keep the volume under control"
            );
            if let Err(restore) = store.set_metadata(metadata).await {
                error!(bucket = %s3.bucket, error = %restore, "failed to restore metadata");
            }
            return Err(CsiError::internal(format!(
                "failed to remove bucket {}: {e}",
                s3.bucket
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CsiController for S3Driver {
    #[instrument(skip_all, fields(volume_id = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.check_controller_capability(ControllerCapability::CreateDeleteVolume)?;

        if req.name.is_empty() {
            return Err(CsiError::invalid("volume name must be provided"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities must be provided"));
        }
        let s3 = S3Config::from_secrets(&req.secrets);
        if s3.bucket.is_empty() {
            return Err(CsiError::invalid("bucket name must be provided"));
        }

        let capacity_bytes = if req.capacity_bytes == 0 {
            info!(
                capacity_bytes = DEFAULT_CAPACITY_BYTES,
                "volume capacity not provided, using default"
            );
            DEFAULT_CAPACITY_BYTES
        } else {
            req.capacity_bytes
        };

        let requested_mounter = req
            .parameters
            .get(MOUNTER_KEY)
            .filter(|m| !m.is_empty())
            .unwrap_or(&s3.mounter);
        let mounter = self.resolve_mounter("", requested_mounter);
        let volume = Volume {
            volume_id: VolumeId(req.name.clone()),
            capacity_bytes,
            volume_context: volume_context(&req.parameters, &s3.bucket, mounter.as_str()),
        };

        if let Some(pv) = self.lookup_volume(&req.name).await? {
            if !pv.is_backed_by(&self.config.driver_name) {
                return Err(CsiError::AlreadyExists(format!(
                    "volume {} exists but was not provisioned by {}",
                    req.name, self.config.driver_name
                )));
            }
            if pv.capacity_bytes != 0 && pv.capacity_bytes != capacity_bytes {
                return Err(CsiError::AlreadyExists(format!(
                    "volume {} exists with capacity {}, requested {capacity_bytes}",
                    req.name, pv.capacity_bytes
                )));
            }
            debug!("volume already provisioned");
            return Ok(descriptor(&pv));
        }

        let store = self.bucket_store(&s3)?;
        let exists = store.bucket_exists().await.map_err(CsiError::internal)?;
        if exists {
            let recorded = store.get_metadata().await.map_err(|e| {
                CsiError::internal(format!("bucket {} exists without usable metadata: {e}", s3.bucket))
            })?;
            if recorded.capacity_bytes != 0 && recorded.capacity_bytes != capacity_bytes {
                return Err(CsiError::AlreadyExists(format!(
                    "volume {} exists with capacity {}, requested {capacity_bytes}",
                    req.name, recorded.capacity_bytes
                )));
            }
            debug!(bucket = %s3.bucket, "bucket already exists");
        } else {
            store.create_bucket().await.map_err(CsiError::internal)?;
        }

        store
            .create_prefix(FS_PATH_PREFIX)
            .await
            .map_err(CsiError::internal)?;
        let metadata = BucketMetadata {
            bucket_name: s3.bucket.clone(),
            fs_path_prefix: FS_PATH_PREFIX.to_owned(),
            capacity_bytes,
            mounter: mounter.as_str().to_owned(),
        };
        store
            .set_metadata(&metadata)
            .await
            .map_err(CsiError::internal)?;

        info!(bucket = %s3.bucket, %mounter, capacity_bytes, "volume created");
        Ok(volume)
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError> {
        self.check_controller_capability(ControllerCapability::CreateDeleteVolume)?;

        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }

        let pv = self.lookup_volume(req.volume_id.as_str()).await?;
        if pv.as_ref().is_some_and(PersistentVolume::is_in_use) {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is in use",
                req.volume_id
            )));
        }

        let mut s3 = S3Config::from_secrets(&req.secrets);
        if s3.bucket.is_empty() {
            if let Some(bucket) = pv.as_ref().and_then(|pv| pv.volume_attributes.get(BUCKET_KEY)) {
                s3.bucket = bucket.clone();
            }
        }
        if s3.bucket.is_empty() {
            info!("no bucket known for volume, nothing to delete");
            return Ok(());
        }

        let store = self.bucket_store(&s3)?;
        let metadata = match store.get_metadata().await {
            Ok(metadata) => metadata,
            Err(e) if e.is_not_found() => {
                info!(bucket = %s3.bucket, "volume metadata absent, treating delete as complete");
                return Ok(());
            }
            Err(e) => return Err(CsiError::internal(e)),
        };

        match self.config.delete_policy {
            DeletePolicy::Retain => {
                info!(bucket = %s3.bucket, "volume deleted, bucket retained");
            }
            DeletePolicy::Purge => {
                self.purge_bucket(&s3, &metadata).await?;
                info!(bucket = %s3.bucket, "volume deleted, bucket removed");
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidationResult, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities missing in request"));
        }
        let s3 = S3Config::from_secrets(&req.secrets);
        if s3.bucket.is_empty() {
            return Err(CsiError::invalid("bucket name must be provided"));
        }

        let store = self.bucket_store(&s3)?;
        if !store.bucket_exists().await.map_err(CsiError::internal)? {
            return Err(CsiError::NotFound(format!("bucket {} does not exist", s3.bucket)));
        }
        store.get_metadata().await?;

        if let Some(unsupported) = req
            .volume_capabilities
            .iter()
            .find(|c| c.access_mode != AccessMode::SingleNodeWriter)
        {
            return Ok(ValidationResult {
                confirmed: None,
                message: format!(
                    "access mode {:?} is not supported, only SingleNodeWriter is",
                    unsupported.access_mode
                ),
            });
        }
        Ok(ValidationResult {
            confirmed: Some(req.volume_capabilities),
            message: String::new(),
        })
    }

    #[instrument(skip_all, fields(starting_token = %req.starting_token))]
    async fn list_volumes(
        &self,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, CsiError> {
        self.check_controller_capability(ControllerCapability::ListVolumes)?;

        let token = if req.starting_token.is_empty() {
            "0"
        } else {
            req.starting_token.as_str()
        };
        let offset: usize = token.parse().map_err(|_| {
            CsiError::Aborted(format!(
                "starting token must be a non-negative integer: {}",
                req.starting_token
            ))
        })?;

        let volumes = self
            .registry
            .list()
            .await
            .map_err(|e| CsiError::internal(format!("failed to list persistent volumes: {e}")))?;

        let driver = self.config.driver_name.as_str();
        let entries: Vec<Volume> = volumes
            .iter()
            .filter(|pv| pv.provisioned_by() == Some(driver))
            .filter(|pv| pv.csi_driver.as_deref() == Some(driver))
            .filter(|pv| matches!(pv.phase, VolumePhase::Available | VolumePhase::Bound))
            .skip(offset)
            .map(descriptor)
            .collect();

        let next_token = if entries.is_empty() {
            String::new()
        } else {
            (offset + entries.len() + 1).to_string()
        };
        debug!(count = entries.len(), %next_token, "listed volumes");
        Ok(ListVolumesResponse {
            entries,
            next_token,
        })
    }

    async fn get_capacity(&self) -> Result<CapacityInfo, CsiError> {
        self.check_controller_capability(ControllerCapability::GetCapacity)?;
        Ok(CapacityInfo {
            available_capacity: None,
            minimum_volume_size: 0,
            maximum_volume_size: None,
        })
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(CONTROLLER_CAPABILITIES.to_vec())
    }

    #[instrument(skip(self))]
    async fn controller_get_volume(
        &self,
        volume_id: &VolumeId,
    ) -> Result<ControllerVolume, CsiError> {
        self.check_controller_capability(ControllerCapability::GetVolume)?;
        if volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }

        let pv = self
            .lookup_volume(volume_id.as_str())
            .await?
            .filter(|pv| pv.is_backed_by(&self.config.driver_name))
            .ok_or_else(|| CsiError::NotFound(format!("volume {volume_id}")))?;

        let condition = match pv.phase {
            VolumePhase::Available | VolumePhase::Bound => VolumeCondition::default(),
            phase => VolumeCondition {
                abnormal: true,
                message: format!("persistent volume is {phase:?}"),
            },
        };
        Ok(ControllerVolume {
            volume: descriptor(&pv),
            condition,
        })
    }
}
