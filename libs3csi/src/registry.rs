//! Read-only view of the orchestrator's persistent-volume registry.
//!
//! The controller never talks to the orchestrator API directly; it asks a
//! [`VolumeRegistry`] for the persistent volumes it may own.  A volume is
//! owned by this driver when its provisioned-by annotation or its CSI
//! source names the driver.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotation written by the external provisioner on every volume it creates.
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumePhase {
    #[default]
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

/// Claim a persistent volume is bound (or reserved) to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
}

/// The fields of a persistent volume the driver cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub name: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Driver named in the volume's CSI source, if it has one.
    #[serde(default)]
    pub csi_driver: Option<String>,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub claim_ref: Option<ClaimRef>,
    #[serde(default)]
    pub phase: VolumePhase,
    /// `volumeAttributes` of the CSI source.
    #[serde(default)]
    pub volume_attributes: HashMap<String, String>,
}

impl PersistentVolume {
    pub fn provisioned_by(&self) -> Option<&str> {
        self.annotations
            .get(PROVISIONED_BY_ANNOTATION)
            .map(String::as_str)
    }

    /// Whether this volume belongs to `driver`.
    pub fn is_backed_by(&self, driver: &str) -> bool {
        self.provisioned_by() == Some(driver) || self.csi_driver.as_deref() == Some(driver)
    }

    /// Still referenced by a claim, whatever the phase.
    pub fn is_in_use(&self) -> bool {
        self.claim_ref.is_some()
    }
}

#[derive(Debug, Clone, Error)]
#[error("volume registry error: {0}")]
pub struct RegistryError(pub String);

/// Lookup of persistent volumes by name.
#[async_trait]
pub trait VolumeRegistry: Send + Sync {
    /// `Ok(None)` when no volume with that name exists.
    async fn get(&self, name: &str) -> Result<Option<PersistentVolume>, RegistryError>;

    /// All persistent volumes, in a stable order.
    async fn list(&self) -> Result<Vec<PersistentVolume>, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume() -> PersistentVolume {
        PersistentVolume {
            name: "pvc-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn ownership_by_annotation_or_csi_source() {
        let mut pv = volume();
        assert!(!pv.is_backed_by("rk8s.s3.csi"));

        pv.annotations
            .insert(PROVISIONED_BY_ANNOTATION.into(), "rk8s.s3.csi".into());
        assert!(pv.is_backed_by("rk8s.s3.csi"));
        assert!(!pv.is_backed_by("other.csi"));

        let mut pv = volume();
        pv.csi_driver = Some("rk8s.s3.csi".into());
        assert!(pv.is_backed_by("rk8s.s3.csi"));
        assert_eq!(pv.provisioned_by(), None);
    }

    #[test]
    fn in_use_follows_claim_reference() {
        let mut pv = volume();
        pv.phase = VolumePhase::Bound;
        assert!(!pv.is_in_use());
        pv.claim_ref = Some(ClaimRef {
            namespace: "default".into(),
            name: "data".into(),
        });
        pv.phase = VolumePhase::Released;
        assert!(pv.is_in_use());
    }
}
