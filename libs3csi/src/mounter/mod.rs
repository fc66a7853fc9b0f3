//! Mounting backends.
//!
//! A [`Mounter`] turns a bucket plus credentials into a kernel-visible FUSE
//! mount by driving an external helper through the [`FuseSupervisor`].
//!
//! | Backend | Helper | Credentials |
//! |---|---|---|
//! | [`MounterKind::S3fs`] (default) | `s3fs` | bucket-scoped password file (0600) |
//! | [`MounterKind::Rclone`] | `rclone mount` | helper environment |
//! | [`MounterKind::Goofys`] | `goofys` | helper environment |
//!
//! All three mount directly at the publish target, so stage and unstage
//! succeed without side effects.

pub mod fuse;
pub mod goofys;
pub mod rclone;
pub mod s3fs;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CsiError;
use crate::s3::{BucketMetadata, S3Config};

pub use fuse::{FuseSupervisor, HelperCommand, HelperRunner, MountTable, ProcessInfo, ProcessTable};

const DEFAULT_REGION: &str = "us-east-1";

/// Closed set of mounting backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MounterKind {
    S3fs,
    Rclone,
    Goofys,
}

impl MounterKind {
    pub const DEFAULT: MounterKind = MounterKind::S3fs;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::S3fs => "s3fs",
            Self::Rclone => "rclone",
            Self::Goofys => "goofys",
        }
    }

    /// Exact (case-insensitive) match against a known identifier.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "s3fs" => Some(Self::S3fs),
            "rclone" => Some(Self::Rclone),
            "goofys" => Some(Self::Goofys),
            _ => None,
        }
    }

    /// Resolve a stored or requested identifier.  Empty selects `fallback`;
    /// an unknown identifier also selects `fallback`, with a warning, so
    /// volumes created for a since-removed backend stay mountable.
    pub fn resolve(value: &str, fallback: MounterKind) -> MounterKind {
        if value.trim().is_empty() {
            return fallback;
        }
        Self::parse(value).unwrap_or_else(|| {
            warn!(
                mounter = value,
                fallback = fallback.as_str(),
                "unknown mounter, using fallback"
            );
            fallback
        })
    }
}

impl fmt::Display for MounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a backend needs to mount one volume.  Built per call and
/// never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct MountDescriptor {
    pub bucket: String,
    pub prefix: String,
    /// Empty when the helper's own default endpoint should be used.
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub kind: MounterKind,
}

impl MountDescriptor {
    pub fn new(meta: &BucketMetadata, config: &S3Config, kind: MounterKind) -> Self {
        let bucket = if meta.bucket_name.is_empty() {
            config.bucket.clone()
        } else {
            meta.bucket_name.clone()
        };
        let region = if config.region.is_empty() {
            DEFAULT_REGION.to_owned()
        } else {
            config.region.clone()
        };
        Self {
            bucket,
            prefix: meta.fs_path_prefix.trim_matches('/').to_owned(),
            endpoint: config.endpoint.clone(),
            region,
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            kind,
        }
    }
}

impl fmt::Debug for MountDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountDescriptor")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("credentials", &"<redacted>")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Stage / unstage / mount contract every backend implements.
#[async_trait]
pub trait Mounter: Send + Sync {
    fn kind(&self) -> MounterKind;

    async fn stage(&self, staging_path: &str) -> Result<(), CsiError>;

    /// Undo [`Self::stage`].  NodeUnstageVolume carries no secrets, so the
    /// node service cannot build a mounter for it and never calls this;
    /// every current backend stages nothing, so there is nothing to undo.
    async fn unstage(&self, staging_path: &str) -> Result<(), CsiError>;

    /// Mount the volume at `target`, returning once the kernel reports it
    /// as a mount point.
    async fn mount(&self, source: &str, target: &str) -> Result<(), CsiError>;
}

/// Build the backend for `kind`.
pub fn new_mounter(
    kind: MounterKind,
    descriptor: MountDescriptor,
    supervisor: Arc<FuseSupervisor>,
    credentials_dir: PathBuf,
) -> Box<dyn Mounter> {
    match kind {
        MounterKind::S3fs => Box::new(s3fs::S3fsMounter::new(
            descriptor,
            supervisor,
            credentials_dir,
        )),
        MounterKind::Rclone => Box::new(rclone::RcloneMounter::new(descriptor, supervisor)),
        MounterKind::Goofys => Box::new(goofys::GoofysMounter::new(descriptor, supervisor)),
    }
}
