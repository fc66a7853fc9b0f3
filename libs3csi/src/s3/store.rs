//! Metadata repository over one bucket.
//!
//! [`BucketStore`] owns the canonical encoding of [`BucketMetadata`] and the
//! bucket layout:
//!
//! ```text
//! <bucket>/
//!   csi-fs/                 # zero-byte directory marker
//!   csi-fs/metadata.json    # BucketMetadata, JSON
//!   csi-fs/...              # volume contents, written through the mount
//! ```
//!
//! Backend errors are passed through wrapped with the failing verb and the
//! bucket name.  The only local recovery is the bulk-delete fallback in
//! [`BucketStore::remove_bucket`] / [`BucketStore::remove_prefix`].

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::client::{ClientError, ObjectInfo, ObjectStoreClient};

/// Logical prefix used as the volume root inside the bucket.
pub const FS_PATH_PREFIX: &str = "csi-fs";

/// Key of the metadata object.
pub const METADATA_KEY: &str = "csi-fs/metadata.json";

const METADATA_CONTENT_TYPE: &str = "application/json";

/// S3 `DeleteObjects` accepts at most 1000 keys per request.
const DELETE_BATCH_SIZE: usize = 1000;

/// Listed objects buffered between the listing task and the deleter.
const LIST_CHANNEL_CAPACITY: usize = 1000;

/// Errors raised by [`BucketStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} on bucket {bucket} failed: {source}")]
    BackendUnavailable {
        op: &'static str,
        bucket: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to encode metadata for bucket {bucket}: {source}")]
    EncodingError {
        bucket: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("object {key} not found in bucket {bucket}")]
    NotFound { bucket: String, key: String },

    #[error("metadata of bucket {bucket} is corrupt: {source}")]
    CorruptMetadata {
        bucket: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "failed to remove {} object(s) from bucket {bucket}: {}",
        .objects.len(),
        .objects.join(", ")
    )]
    PartialDeleteFailure {
        bucket: String,
        objects: Vec<String>,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Keys to delete for one listed object.
///
/// Listings drop the trailing `/` of directory markers (`csi-fs/sub/` is
/// listed as `csi-fs/sub`), so a zero-byte entry may be either spelling.
/// Both are deleted; removing an absent key succeeds.
fn deletion_keys(object: ObjectInfo) -> Vec<String> {
    if object.size == 0 && !object.key.ends_with('/') {
        let marker = format!("{}/", object.key);
        vec![object.key, marker]
    } else {
        vec![object.key]
    }
}

/// Volume description persisted inside the bucket.
///
/// Always replaced wholesale; there is exactly one per bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketMetadata {
    pub bucket_name: String,
    pub fs_path_prefix: String,
    pub capacity_bytes: u64,
    /// Raw mounter identifier.  Kept as a string so volumes created with a
    /// since-removed backend still decode.
    #[serde(default)]
    pub mounter: String,
}

/// Repository for one bucket's existence, prefix and metadata.
#[derive(Clone)]
pub struct BucketStore {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
}

impl BucketStore {
    pub fn new(client: Arc<dyn ObjectStoreClient>) -> Self {
        let bucket = client.bucket().to_owned();
        Self { client, bucket }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn backend(&self, op: &'static str) -> impl FnOnce(ClientError) -> StoreError + '_ {
        move |source| StoreError::BackendUnavailable {
            op,
            bucket: self.bucket.clone(),
            source,
        }
    }

    pub async fn bucket_exists(&self) -> Result<bool, StoreError> {
        self.client
            .bucket_exists()
            .await
            .map_err(self.backend("check bucket"))
    }

    /// Create the bucket.  Callers check [`Self::bucket_exists`] first; the
    /// behaviour on an existing bucket is up to the service.
    pub async fn create_bucket(&self) -> Result<(), StoreError> {
        self.client
            .create_bucket()
            .await
            .map_err(self.backend("create bucket"))?;
        info!(bucket = %self.bucket, "bucket created");
        Ok(())
    }

    /// Write the zero-byte `<prefix>/` marker.  Safe to repeat.
    pub async fn create_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let key = format!("{}/", prefix.trim_end_matches('/'));
        debug!(bucket = %self.bucket, %key, "creating prefix");
        self.client
            .put_object(&key, Bytes::new(), None)
            .await
            .map_err(self.backend("create prefix"))
    }

    /// Serialize `metadata` and overwrite the metadata object.
    pub async fn set_metadata(&self, metadata: &BucketMetadata) -> Result<(), StoreError> {
        let body = serde_json::to_vec(metadata).map_err(|source| StoreError::EncodingError {
            bucket: self.bucket.clone(),
            source,
        })?;
        self.client
            .put_object(METADATA_KEY, Bytes::from(body), Some(METADATA_CONTENT_TYPE))
            .await
            .map_err(self.backend("write metadata"))
    }

    /// Read and decode the metadata object.
    pub async fn get_metadata(&self) -> Result<BucketMetadata, StoreError> {
        let body = self
            .client
            .get_object(METADATA_KEY)
            .await
            .map_err(self.backend("read metadata"))?
            .ok_or_else(|| StoreError::NotFound {
                bucket: self.bucket.clone(),
                key: METADATA_KEY.to_owned(),
            })?;
        serde_json::from_slice(&body).map_err(|source| StoreError::CorruptMetadata {
            bucket: self.bucket.clone(),
            source,
        })
    }

    /// Delete every object in the bucket, then the bucket itself.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn remove_bucket(&self) -> Result<(), StoreError> {
        self.remove_objects(None).await?;
        self.client
            .remove_object(&format!("{FS_PATH_PREFIX}/"))
            .await
            .map_err(self.backend("remove prefix marker"))?;
        self.client
            .remove_bucket()
            .await
            .map_err(self.backend("remove bucket"))?;
        info!("bucket removed");
        Ok(())
    }

    /// Delete every object under `prefix`, then the prefix marker.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let prefix = prefix.trim_end_matches('/');
        self.remove_objects(Some(prefix)).await?;
        self.client
            .remove_object(&format!("{prefix}/"))
            .await
            .map_err(self.backend("remove prefix marker"))?;
        info!(%prefix, "prefix removed");
        Ok(())
    }

    /// Stream the listing through a bounded channel and delete in batches.
    ///
    /// The listing task stops at its first error and closes the channel; the
    /// deleter then stops issuing deletes and reports the listing error.
    async fn remove_objects(&self, prefix: Option<&str>) -> Result<(), StoreError> {
        let (tx, mut rx) = mpsc::channel::<Result<ObjectInfo, ClientError>>(LIST_CHANNEL_CAPACITY);
        let client = Arc::clone(&self.client);
        let list_prefix = prefix.map(str::to_owned);
        let lister = tokio::spawn(async move {
            let mut objects = client.list_objects(list_prefix.as_deref());
            while let Some(item) = objects.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        let mut batch = Vec::with_capacity(DELETE_BATCH_SIZE);
        let mut survivors = Vec::new();
        while let Some(item) = rx.recv().await {
            match item {
                Ok(object) => {
                    for key in deletion_keys(object) {
                        batch.push(key);
                        if batch.len() == DELETE_BATCH_SIZE {
                            survivors
                                .extend(self.delete_batch(std::mem::take(&mut batch)).await);
                        }
                    }
                }
                Err(source) => {
                    error!(error = %source, "listing objects failed, aborting delete");
                    lister.abort();
                    return Err(StoreError::BackendUnavailable {
                        op: "list objects",
                        bucket: self.bucket.clone(),
                        source,
                    });
                }
            }
        }
        if !batch.is_empty() {
            survivors.extend(self.delete_batch(batch).await);
        }
        if let Err(e) = lister.await {
            warn!(error = %e, "object listing task did not finish cleanly");
        }

        if survivors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::PartialDeleteFailure {
                bucket: self.bucket.clone(),
                objects: survivors,
            })
        }
    }

    /// Bulk-delete `keys`, retrying whatever the batch refused one object at
    /// a time.  Returns the keys that survived both attempts.
    async fn delete_batch(&self, keys: Vec<String>) -> Vec<String> {
        let failed = match self.client.remove_objects(keys.clone()).await {
            Ok(errors) if errors.is_empty() => return Vec::new(),
            Ok(errors) => {
                for e in &errors {
                    warn!(key = %e.key, reason = %e.reason, "bulk delete refused object");
                }
                errors.into_iter().map(|e| e.key).collect::<Vec<_>>()
            }
            Err(e) => {
                warn!(error = %e, count = keys.len(), "bulk delete request failed");
                keys
            }
        };

        warn!(count = failed.len(), "falling back to per-object delete");
        let mut survivors = Vec::new();
        for key in failed {
            if let Err(e) = self.client.remove_object(&key).await {
                error!(%key, error = %e, "failed to remove object");
                survivors.push(key);
            }
        }
        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryObjectStore;

    fn metadata() -> BucketMetadata {
        BucketMetadata {
            bucket_name: "data-01".into(),
            fs_path_prefix: FS_PATH_PREFIX.into(),
            capacity_bytes: 512 * 1024 * 1024,
            mounter: "s3fs".into(),
        }
    }

    fn store_with(objects: &[&str]) -> (Arc<MemoryObjectStore>, BucketStore) {
        let backend = Arc::new(MemoryObjectStore::new("data-01"));
        backend.set_exists(true);
        for key in objects {
            let body: &[u8] = if key.ends_with('/') { b"" } else { b"x" };
            backend.insert(key, body);
        }
        let store = BucketStore::new(backend.clone());
        (backend, store)
    }

    #[tokio::test]
    async fn metadata_survives_set_then_get() {
        let (_, store) = store_with(&[]);
        let meta = metadata();
        store.set_metadata(&meta).await.unwrap();
        assert_eq!(store.get_metadata().await.unwrap(), meta);
    }

    #[tokio::test]
    async fn metadata_uses_camel_case_keys() {
        let (backend, store) = store_with(&[]);
        store.set_metadata(&metadata()).await.unwrap();
        let raw = backend.object(METADATA_KEY).expect("metadata written");
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["bucketName"], "data-01");
        assert_eq!(json["fsPathPrefix"], "csi-fs");
        assert_eq!(json["capacityBytes"], 512 * 1024 * 1024);
        assert_eq!(
            backend.content_type(METADATA_KEY).as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn missing_metadata_is_not_found() {
        let (_, store) = store_with(&[]);
        let err = store.get_metadata().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn garbage_metadata_is_corrupt() {
        let (backend, store) = store_with(&[]);
        backend.insert(METADATA_KEY, b"{not json");
        let err = store.get_metadata().await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptMetadata { .. }));
    }

    #[tokio::test]
    async fn create_prefix_writes_empty_marker() {
        let (backend, store) = store_with(&[]);
        store.create_prefix(FS_PATH_PREFIX).await.unwrap();
        store.create_prefix(FS_PATH_PREFIX).await.unwrap();
        assert_eq!(backend.object("csi-fs/").as_deref(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn backend_errors_name_verb_and_bucket() {
        let (backend, store) = store_with(&[]);
        backend.fail_requests(true);
        let err = store.bucket_exists().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "check bucket on bucket data-01 failed: injected failure"
        );
    }

    #[tokio::test]
    async fn remove_bucket_empties_and_removes() {
        let (backend, store) = store_with(&["csi-fs/", "csi-fs/a", "csi-fs/b", "other"]);
        store.remove_bucket().await.unwrap();
        assert!(backend.keys().is_empty());
        assert!(!backend.exists());
    }

    #[tokio::test]
    async fn remove_bucket_deletes_nested_directory_markers() {
        let (backend, store) =
            store_with(&["csi-fs/", "csi-fs/sub/", "csi-fs/sub/file", "csi-fs/sub/deeper/"]);
        store.remove_bucket().await.unwrap();
        assert!(backend.keys().is_empty());
        assert!(!backend.exists());
    }

    #[tokio::test]
    async fn remove_prefix_deletes_nested_directory_markers() {
        let (backend, store) = store_with(&["csi-fs/", "csi-fs/sub/", "keep/"]);
        store.remove_prefix("csi-fs").await.unwrap();
        assert_eq!(backend.keys(), vec!["keep/".to_owned()]);
    }

    #[tokio::test]
    async fn surviving_directory_marker_is_reported() {
        let (backend, store) = store_with(&["csi-fs/sub/", "csi-fs/a"]);
        backend.refuse_in_batch("csi-fs/sub/");
        backend.refuse_single("csi-fs/sub/");
        let err = store.remove_prefix("csi-fs").await.unwrap_err();
        match err {
            StoreError::PartialDeleteFailure { objects, .. } => {
                assert_eq!(objects, vec!["csi-fs/sub/".to_owned()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_byte_entries_cover_both_spellings() {
        let keys = deletion_keys(ObjectInfo {
            key: "csi-fs/sub".into(),
            size: 0,
        });
        assert_eq!(keys, vec!["csi-fs/sub".to_owned(), "csi-fs/sub/".to_owned()]);
        let keys = deletion_keys(ObjectInfo {
            key: "csi-fs/file".into(),
            size: 5,
        });
        assert_eq!(keys, vec!["csi-fs/file".to_owned()]);
    }

    #[tokio::test]
    async fn remove_prefix_keeps_other_objects() {
        let (backend, store) = store_with(&["csi-fs/", "csi-fs/a", "keep/me"]);
        store.remove_prefix("csi-fs").await.unwrap();
        assert_eq!(backend.keys(), vec!["keep/me".to_owned()]);
        assert!(backend.exists());
    }

    #[tokio::test]
    async fn batch_refusals_are_retried_individually() {
        let (backend, store) = store_with(&["csi-fs/a", "csi-fs/b", "csi-fs/c"]);
        backend.refuse_in_batch("csi-fs/b");
        store.remove_prefix("csi-fs").await.unwrap();
        assert!(backend.keys().is_empty());
        assert_eq!(backend.single_remove_calls(), vec!["csi-fs/b".to_owned(), "csi-fs/".to_owned()]);
    }

    #[tokio::test]
    async fn objects_failing_both_tiers_are_reported() {
        let (backend, store) = store_with(&["csi-fs/a", "csi-fs/b", "csi-fs/c"]);
        backend.refuse_in_batch("csi-fs/b");
        backend.refuse_in_batch("csi-fs/c");
        backend.refuse_single("csi-fs/c");
        let err = store.remove_prefix("csi-fs").await.unwrap_err();
        match err {
            StoreError::PartialDeleteFailure { bucket, objects } => {
                assert_eq!(bucket, "data-01");
                assert_eq!(objects, vec!["csi-fs/c".to_owned()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.keys(), vec!["csi-fs/c".to_owned()]);
        assert!(backend.exists());
    }

    #[tokio::test]
    async fn failed_batch_request_falls_back_for_every_key() {
        let (backend, store) = store_with(&["a", "b"]);
        backend.fail_batch_requests(true);
        store.remove_bucket().await.unwrap();
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn listing_error_stops_deletes() {
        let keys: Vec<String> = (0..10).map(|i| format!("csi-fs/{i:02}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (backend, store) = store_with(&refs);
        backend.fail_listing_after(3);
        let err = store.remove_prefix("csi-fs").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::BackendUnavailable { op: "list objects", .. }
        ));
        // Nothing was deleted from the truncated listing.
        assert_eq!(backend.keys().len(), 10);
        assert!(backend.batch_remove_calls() == 0);
    }

    #[tokio::test]
    async fn large_listings_are_deleted_in_batches() {
        let keys: Vec<String> = (0..2500).map(|i| format!("csi-fs/{i:05}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (backend, store) = store_with(&refs);
        store.remove_prefix("csi-fs").await.unwrap();
        assert!(backend.keys().is_empty());
        assert_eq!(backend.batch_remove_calls(), 3);
    }
}
