//! Bucket-bound object-store client.
//!
//! [`ObjectStoreClient`] is the narrow surface the metadata repository needs
//! from an S3-compatible service.  [`S3Client`] implements it with the
//! `object_store` crate for object I/O, and with SigV4-signed `reqwest`
//! calls for the requests `object_store` does not model: bucket
//! head/create/delete, and directory-marker keys ending in `/` (which
//! `object_store` paths normalise away).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder, AwsAuthorizer, AwsCredential};
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::S3Config;

const DEFAULT_REGION: &str = "us-east-1";

/// Error reported by an [`ObjectStoreClient`].  The repository wraps it with
/// the failing verb and bucket.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct ClientError(pub String);

impl ClientError {
    pub fn new<E: fmt::Display>(e: E) -> Self {
        Self(e.to_string())
    }
}

/// An object returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Per-object failure reported by a batched delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveObjectError {
    pub key: String,
    pub reason: String,
}

/// Stream of listed objects.  The first `Err` ends the listing.
pub type ObjectStream<'a> = BoxStream<'a, Result<ObjectInfo, ClientError>>;

/// Object-store operations scoped to a single bucket.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// The bucket this client is bound to.
    fn bucket(&self) -> &str;

    async fn bucket_exists(&self) -> Result<bool, ClientError>;

    async fn create_bucket(&self) -> Result<(), ClientError>;

    /// Remove the (empty) bucket.  Removing a missing bucket succeeds.
    async fn remove_bucket(&self) -> Result<(), ClientError>;

    /// Fetch an object.  `Ok(None)` when the key does not exist.
    async fn get_object(&self, key: &str) -> Result<Option<Bytes>, ClientError>;

    /// Create or overwrite an object.
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), ClientError>;

    /// Recursively list objects under `prefix` (the whole bucket if `None`).
    /// Directory markers may come back without their trailing `/`.
    fn list_objects(&self, prefix: Option<&str>) -> ObjectStream<'_>;

    async fn remove_object(&self, key: &str) -> Result<(), ClientError>;

    /// Delete `keys` in one batched request.  A transport failure is an
    /// `Err`; objects the service refused are returned individually.
    async fn remove_objects(&self, keys: Vec<String>)
    -> Result<Vec<RemoveObjectError>, ClientError>;
}

/// Builds a client for the bucket named in an [`S3Config`].
pub trait ClientFactory: Send + Sync {
    fn connect(&self, config: &S3Config) -> Result<Arc<dyn ObjectStoreClient>, ClientError>;
}

// ---------------------------------------------------------------------------
// S3Client
// ---------------------------------------------------------------------------

/// [`ObjectStoreClient`] for Amazon S3 and S3-compatible services (MinIO,
/// Ceph RGW, ...), always using path-style addressing.
pub struct S3Client {
    bucket: String,
    region: String,
    credential: AwsCredential,
    store: AmazonS3,
    http: reqwest::Client,
    bucket_url: Url,
}

impl S3Client {
    /// Build a client from connection settings.  No request is issued.
    pub fn new(config: &S3Config, http: reqwest::Client) -> Result<Self, ClientError> {
        if config.bucket.is_empty() {
            return Err(ClientError::new("bucket name is empty"));
        }
        let region = if config.region.is_empty() {
            DEFAULT_REGION.to_owned()
        } else {
            config.region.clone()
        };
        let endpoint = if config.endpoint.is_empty() {
            format!("https://s3.{region}.amazonaws.com")
        } else {
            config.endpoint.clone()
        };
        let endpoint_url = Url::parse(&endpoint)
            .map_err(|e| ClientError(format!("invalid endpoint `{endpoint}`: {e}")))?;

        let store = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&region)
            .with_endpoint(endpoint_url.as_str().trim_end_matches('/'))
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_allow_http(endpoint_url.scheme() == "http")
            .build()
            .map_err(ClientError::new)?;

        let mut bucket_url = endpoint_url;
        bucket_url
            .path_segments_mut()
            .map_err(|_| ClientError(format!("endpoint `{endpoint}` cannot be a base URL")))?
            .pop_if_empty()
            .push(&config.bucket);

        Ok(Self {
            bucket: config.bucket.clone(),
            region,
            credential: AwsCredential {
                key_id: config.access_key_id.clone(),
                secret_key: config.secret_access_key.clone(),
                token: None,
            },
            store,
            http,
            bucket_url,
        })
    }

    /// Path-style URL of `key`, keeping a trailing `/` intact.
    fn object_url(&self, key: &str) -> Url {
        let mut url = self.bucket_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(key.split('/'));
        }
        url
    }

    async fn send_signed(
        &self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut builder = self.http.request(method, url);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let mut request = builder.build().map_err(ClientError::new)?;
        AwsAuthorizer::new(&self.credential, "s3", &self.region).authorize(&mut request, None);
        self.http.execute(request).await.map_err(ClientError::new)
    }
}

async fn ensure_success(response: reqwest::Response, op: &str) -> Result<(), ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError(format!("{op} returned {status}: {body}")))
}

#[async_trait]
impl ObjectStoreClient for S3Client {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> Result<bool, ClientError> {
        let response = self
            .send_signed(Method::HEAD, self.bucket_url.clone(), None)
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ClientError(format!("HeadBucket returned {status}"))),
        }
    }

    async fn create_bucket(&self) -> Result<(), ClientError> {
        // us-east-1 rejects an explicit location constraint.
        let body = (self.region != DEFAULT_REGION).then(|| {
            Bytes::from(format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            ))
        });
        let response = self
            .send_signed(Method::PUT, self.bucket_url.clone(), body)
            .await?;
        ensure_success(response, "CreateBucket").await
    }

    async fn remove_bucket(&self) -> Result<(), ClientError> {
        let response = self
            .send_signed(Method::DELETE, self.bucket_url.clone(), None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(bucket = %self.bucket, "bucket already gone");
            return Ok(());
        }
        ensure_success(response, "DeleteBucket").await
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>, ClientError> {
        match self.store.get(&ObjectPath::from(key)).await {
            Ok(result) => result.bytes().await.map(Some).map_err(ClientError::new),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(ClientError::new(e)),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), ClientError> {
        if key.ends_with('/') {
            let response = self
                .send_signed(Method::PUT, self.object_url(key), Some(body))
                .await?;
            return ensure_success(response, "PutObject").await;
        }

        let mut attributes = Attributes::new();
        if let Some(content_type) = content_type {
            attributes.insert(Attribute::ContentType, content_type.to_owned().into());
        }
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };
        self.store
            .put_opts(&ObjectPath::from(key), PutPayload::from(body), opts)
            .await
            .map(|_| ())
            .map_err(ClientError::new)
    }

    fn list_objects(&self, prefix: Option<&str>) -> ObjectStream<'_> {
        let prefix = prefix.map(ObjectPath::from);
        self.store
            .list(prefix.as_ref())
            .map(|item| {
                item.map(|meta| ObjectInfo {
                    key: meta.location.to_string(),
                    size: meta.size as u64,
                })
                .map_err(ClientError::new)
            })
            .boxed()
    }

    async fn remove_object(&self, key: &str) -> Result<(), ClientError> {
        if key.ends_with('/') {
            let response = self
                .send_signed(Method::DELETE, self.object_url(key), None)
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
            return ensure_success(response, "DeleteObject").await;
        }
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(ClientError::new(e)),
        }
    }

    async fn remove_objects(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<RemoveObjectError>, ClientError> {
        let (markers, keys): (Vec<String>, Vec<String>) =
            keys.into_iter().partition(|key| key.ends_with('/'));

        let mut failures = Vec::new();
        for key in markers {
            if let Err(e) = self.remove_object(&key).await {
                failures.push(RemoveObjectError {
                    key,
                    reason: e.to_string(),
                });
            }
        }

        let locations = stream::iter(
            keys.iter()
                .map(|key| Ok(ObjectPath::from(key.as_str())))
                .collect::<Vec<_>>(),
        )
        .boxed();
        // `delete_stream` yields one result per location, in input order.
        let results: Vec<object_store::Result<ObjectPath>> =
            self.store.delete_stream(locations).collect().await;
        for (key, result) in keys.into_iter().zip(results) {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => failures.push(RemoveObjectError {
                    key,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(failures)
    }
}

/// [`ClientFactory`] producing [`S3Client`]s that share one HTTP pool.
#[derive(Debug, Clone, Default)]
pub struct S3ClientFactory {
    http: reqwest::Client,
}

impl S3ClientFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientFactory for S3ClientFactory {
    fn connect(&self, config: &S3Config) -> Result<Arc<dyn ObjectStoreClient>, ClientError> {
        let client = S3Client::new(config, self.http.clone())?;
        Ok(Arc::new(client))
    }
}
