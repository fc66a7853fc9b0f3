//! Object-store access.
//!
//! [`client`] defines the bucket-bound [`ObjectStoreClient`] seam and its
//! production implementation on top of the `object_store` crate.  [`store`]
//! is the metadata repository the driver talks to: bucket lifecycle, the
//! `csi-fs/` prefix, the JSON metadata object and the two-tier bulk delete.

pub mod client;
pub mod store;

use std::collections::HashMap;
use std::fmt;

use crate::config::{
    BUCKET_KEY, MOUNTER_KEY, SECRET_ACCESS_KEY_ID, SECRET_ENDPOINT, SECRET_REGION,
    SECRET_SECRET_ACCESS_KEY,
};

pub use client::{
    ClientError, ClientFactory, ObjectInfo, ObjectStoreClient, RemoveObjectError, S3Client,
    S3ClientFactory,
};
pub use store::{BucketMetadata, BucketStore, FS_PATH_PREFIX, METADATA_KEY, StoreError};

/// Connection settings for one bucket, parsed from per-call secrets.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint: String,
    /// Mounter named in the secrets, if any.  Bucket metadata takes priority.
    pub mounter: String,
}

impl S3Config {
    pub fn from_secrets(secrets: &HashMap<String, String>) -> Self {
        let get = |key: &str| secrets.get(key).cloned().unwrap_or_default();
        Self {
            bucket: get(BUCKET_KEY),
            access_key_id: get(SECRET_ACCESS_KEY_ID),
            secret_access_key: get(SECRET_SECRET_ACCESS_KEY),
            region: get(SECRET_REGION),
            endpoint: get(SECRET_ENDPOINT),
            mounter: get(MOUNTER_KEY),
        }
    }

    /// `accessKeyID:secretAccessKey`, the format s3fs expects in its
    /// password file.
    pub fn credential_pair(&self) -> String {
        format!("{}:{}", self.access_key_id, self.secret_access_key)
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("access_key_id", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("mounter", &self.mounter)
            .finish()
    }
}
