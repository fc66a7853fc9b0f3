//! S3 bucket backend for CSI.
//!
//! [`S3Driver`] implements [`CsiIdentity`], [`CsiController`] and [`CsiNode`]
//! over three independently mutable stores:
//!
//! - the orchestrator's persistent-volume registry ([`VolumeRegistry`]),
//!   which decides whether a volume already exists;
//! - the object store, where each volume is one bucket carrying a
//!   `csi-fs/` prefix and a JSON metadata object ([`BucketStore`]);
//! - the node's mount table, driven through a [`FuseSupervisor`].
//!
//! The driver keeps no state of its own.  Every call re-reads the registry
//! and the bucket, so concurrent calls for different volumes never share
//! anything mutable.
//!
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

mod controller;
mod node;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mounter::{self, FuseSupervisor, MountDescriptor, Mounter, MounterKind};
use crate::registry::VolumeRegistry;
use crate::s3::{BucketMetadata, BucketStore, ClientFactory, S3ClientFactory, S3Config};
use crate::types::*;

/// Controller RPCs this driver serves.
const CONTROLLER_CAPABILITIES: &[ControllerCapability] = &[
    ControllerCapability::CreateDeleteVolume,
    ControllerCapability::GetCapacity,
    ControllerCapability::GetVolume,
    ControllerCapability::ListVolumes,
    ControllerCapability::VolumeCondition,
];

/// Node RPCs this driver serves.
const NODE_CAPABILITIES: &[NodeCapability] = &[
    NodeCapability::StageUnstageVolume,
    NodeCapability::GetVolumeStats,
    NodeCapability::VolumeCondition,
];

/// CSI driver exposing S3 buckets as FUSE-mounted volumes.
pub struct S3Driver {
    config: DriverConfig,
    registry: Arc<dyn VolumeRegistry>,
    clients: Arc<dyn ClientFactory>,
    supervisor: Arc<FuseSupervisor>,
}

impl S3Driver {
    pub fn new(
        config: DriverConfig,
        registry: Arc<dyn VolumeRegistry>,
        clients: Arc<dyn ClientFactory>,
        supervisor: Arc<FuseSupervisor>,
    ) -> Self {
        Self {
            config,
            registry,
            clients,
            supervisor,
        }
    }

    /// Driver talking to real S3 endpoints and the host's mount table.
    pub fn with_system(config: DriverConfig, registry: Arc<dyn VolumeRegistry>) -> Self {
        Self::new(
            config,
            registry,
            Arc::new(S3ClientFactory::new()),
            Arc::new(FuseSupervisor::system()),
        )
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Open the metadata repository for the bucket named in `s3`.
    fn bucket_store(&self, s3: &S3Config) -> Result<BucketStore, CsiError> {
        let client = self.clients.connect(s3).map_err(|e| {
            CsiError::internal(format!("failed to initialize S3 client for {}: {e}", s3.bucket))
        })?;
        Ok(BucketStore::new(client))
    }

    fn check_controller_capability(&self, capability: ControllerCapability) -> Result<(), CsiError> {
        if CONTROLLER_CAPABILITIES.contains(&capability) {
            Ok(())
        } else {
            Err(CsiError::invalid(format!("unsupported capability {capability}")))
        }
    }

    /// Backend for a volume: the metadata's mounter, else the one named in
    /// the secrets, else the configured default.
    fn resolve_mounter(&self, recorded: &str, requested: &str) -> MounterKind {
        let fallback = self.config.default_mounter;
        if recorded.trim().is_empty() {
            MounterKind::resolve(requested, fallback)
        } else {
            MounterKind::resolve(recorded, fallback)
        }
    }

    fn build_mounter(&self, s3: &S3Config, metadata: &BucketMetadata) -> Box<dyn Mounter> {
        let kind = self.resolve_mounter(&metadata.mounter, &s3.mounter);
        mounter::new_mounter(
            kind,
            MountDescriptor::new(metadata, s3, kind),
            Arc::clone(&self.supervisor),
            self.config.credentials_dir.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for S3Driver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}
