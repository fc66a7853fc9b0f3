//! Driver configuration and well-known keys.
//!
//! Environment variables (read once by [`DriverConfig::from_env`]):
//! - `S3CSI_DRIVER_NAME`: driver name advertised to the orchestrator.
//!   Defaults to `rk8s.s3.csi`.
//! - `S3CSI_NODE_ID`: node identifier returned by `NodeGetInfo`.
//!   Defaults to the empty string (controller-only deployments).
//! - `S3CSI_DEFAULT_MOUNTER`: `s3fs`, `rclone` or `goofys`.  Defaults to
//!   `s3fs`; unknown values fall back to it.
//! - `S3CSI_DELETE_POLICY`: `retain` (default) keeps bucket contents on
//!   `DeleteVolume`, `purge` removes them.
//! - `S3CSI_CREDENTIALS_DIR`: directory for mount credential files.
//!   Defaults to `$HOME`.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::mounter::MounterKind;

/// Driver name used when `S3CSI_DRIVER_NAME` is unset.
pub const DEFAULT_DRIVER_NAME: &str = "rk8s.s3.csi";

/// Capacity substituted when `CreateVolume` does not specify one (10 GiB).
pub const DEFAULT_CAPACITY_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Secret holding the access key id.
pub const SECRET_ACCESS_KEY_ID: &str = "accessKeyID";
/// Secret holding the secret access key.
pub const SECRET_SECRET_ACCESS_KEY: &str = "secretAccessKey";
/// Secret holding the object store region.
pub const SECRET_REGION: &str = "region";
/// Secret holding the object store endpoint URL.
pub const SECRET_ENDPOINT: &str = "endpoint";

/// Secret / context key selecting the mounting backend.
pub const MOUNTER_KEY: &str = "mounter";
/// Secret / context key naming the bucket.
pub const BUCKET_KEY: &str = "bucket";
/// Context key naming the volume prefix.
pub const PREFIX_KEY: &str = "prefix";

/// What `DeleteVolume` does with the bucket of a deleted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Leave the bucket and its objects untouched.
    #[default]
    Retain,
    /// Empty and remove the bucket.
    Purge,
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" => Ok(Self::Retain),
            "purge" => Ok(Self::Purge),
            other => Err(format!("unknown delete policy `{other}`")),
        }
    }
}

/// Process-wide driver settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub vendor_version: String,
    pub node_id: String,
    /// Backend used when neither the bucket metadata nor the secrets name one.
    pub default_mounter: MounterKind,
    pub delete_policy: DeletePolicy,
    /// Directory holding per-bucket mount credential files.
    pub credentials_dir: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: String::new(),
            default_mounter: MounterKind::DEFAULT,
            delete_policy: DeletePolicy::Retain,
            credentials_dir: home_dir(),
        }
    }
}

impl DriverConfig {
    /// Build the configuration from `S3CSI_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.  Unset or
    /// unparsable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(name) = lookup("S3CSI_DRIVER_NAME").filter(|v| !v.is_empty()) {
            config.driver_name = name;
        }
        if let Some(node_id) = lookup("S3CSI_NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(mounter) = lookup("S3CSI_DEFAULT_MOUNTER") {
            config.default_mounter = MounterKind::resolve(&mounter, MounterKind::DEFAULT);
        }
        if let Some(policy) = lookup("S3CSI_DELETE_POLICY") {
            match policy.parse() {
                Ok(policy) => config.delete_policy = policy,
                Err(e) => warn!(error = %e, "ignoring S3CSI_DELETE_POLICY"),
            }
        }
        if let Some(dir) = lookup("S3CSI_CREDENTIALS_DIR").filter(|v| !v.is_empty()) {
            config.credentials_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = DriverConfig::from_lookup(|_| None);
        assert_eq!(config.driver_name, DEFAULT_DRIVER_NAME);
        assert_eq!(config.default_mounter, MounterKind::S3fs);
        assert_eq!(config.delete_policy, DeletePolicy::Retain);
    }

    #[test]
    fn lookup_overrides() {
        let env = HashMap::from([
            ("S3CSI_DRIVER_NAME", "example.s3.csi"),
            ("S3CSI_NODE_ID", "node-7"),
            ("S3CSI_DEFAULT_MOUNTER", "rclone"),
            ("S3CSI_DELETE_POLICY", "Purge"),
            ("S3CSI_CREDENTIALS_DIR", "/etc/s3csi"),
        ]);
        let config = DriverConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.driver_name, "example.s3.csi");
        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.default_mounter, MounterKind::Rclone);
        assert_eq!(config.delete_policy, DeletePolicy::Purge);
        assert_eq!(config.credentials_dir, PathBuf::from("/etc/s3csi"));
    }

    #[test]
    fn bad_values_keep_defaults() {
        let env = HashMap::from([
            ("S3CSI_DEFAULT_MOUNTER", "juicefs"),
            ("S3CSI_DELETE_POLICY", "shred"),
        ]);
        let config = DriverConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.default_mounter, MounterKind::S3fs);
        assert_eq!(config.delete_policy, DeletePolicy::Retain);
    }
}
