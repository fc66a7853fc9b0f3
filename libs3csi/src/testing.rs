//! In-memory collaborators for unit tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures::stream::{self, StreamExt};

use crate::backend::s3::S3Driver;
use crate::config::{BUCKET_KEY, DriverConfig, SECRET_ACCESS_KEY_ID, SECRET_SECRET_ACCESS_KEY};
use crate::mounter::{
    FuseSupervisor, HelperCommand, HelperRunner, MountTable, ProcessInfo, ProcessTable,
};
use crate::registry::{PersistentVolume, RegistryError, VolumeRegistry};
use crate::s3::client::ObjectStream;
use crate::s3::{
    ClientError, ClientFactory, ObjectInfo, ObjectStoreClient, RemoveObjectError, S3Config,
};
use crate::types::Secrets;

fn injected() -> ClientError {
    ClientError::new("injected failure")
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

struct StoredObject {
    body: Bytes,
    content_type: Option<String>,
}

/// One bucket held in memory.
pub struct MemoryObjectStore {
    bucket: String,
    exists: AtomicBool,
    objects: DashMap<String, StoredObject>,
    refused_in_batch: DashSet<String>,
    refused_single: DashSet<String>,
    fail_requests: AtomicBool,
    fail_batch_requests: AtomicBool,
    list_fail_after: Mutex<Option<usize>>,
    create_bucket_calls: AtomicUsize,
    batch_remove_calls: AtomicUsize,
    single_remove_calls: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            exists: AtomicBool::new(false),
            objects: DashMap::new(),
            refused_in_batch: DashSet::new(),
            refused_single: DashSet::new(),
            fail_requests: AtomicBool::new(false),
            fail_batch_requests: AtomicBool::new(false),
            list_fail_after: Mutex::new(None),
            create_bucket_calls: AtomicUsize::new(0),
            batch_remove_calls: AtomicUsize::new(0),
            single_remove_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_exists(&self, exists: bool) {
        self.exists.store(exists, Ordering::SeqCst);
    }

    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    pub fn insert(&self, key: &str, body: &[u8]) {
        self.objects.insert(
            key.to_owned(),
            StoredObject {
                body: Bytes::copy_from_slice(body),
                content_type: None,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|o| o.body.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.get(key).and_then(|o| o.content_type.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Every request other than deletes fails.
    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// The batched delete request itself fails.
    pub fn fail_batch_requests(&self, fail: bool) {
        self.fail_batch_requests.store(fail, Ordering::SeqCst);
    }

    /// The batched delete reports `key` as a per-object failure.
    pub fn refuse_in_batch(&self, key: &str) {
        self.refused_in_batch.insert(key.to_owned());
    }

    /// Single-object deletes of `key` fail.
    pub fn refuse_single(&self, key: &str) {
        self.refused_single.insert(key.to_owned());
    }

    /// Listings yield `n` objects and then an error.
    pub fn fail_listing_after(&self, n: usize) {
        *self.list_fail_after.lock().unwrap() = Some(n);
    }

    pub fn create_bucket_calls(&self) -> usize {
        self.create_bucket_calls.load(Ordering::SeqCst)
    }

    pub fn batch_remove_calls(&self) -> usize {
        self.batch_remove_calls.load(Ordering::SeqCst)
    }

    pub fn single_remove_calls(&self) -> Vec<String> {
        self.single_remove_calls.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), ClientError> {
        if self.fail_requests.load(Ordering::SeqCst) {
            Err(injected())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> Result<bool, ClientError> {
        self.check()?;
        Ok(self.exists())
    }

    async fn create_bucket(&self) -> Result<(), ClientError> {
        self.check()?;
        self.create_bucket_calls.fetch_add(1, Ordering::SeqCst);
        if self.exists.swap(true, Ordering::SeqCst) {
            return Err(ClientError::new("BucketAlreadyOwnedByYou"));
        }
        Ok(())
    }

    async fn remove_bucket(&self) -> Result<(), ClientError> {
        self.check()?;
        if !self.objects.is_empty() {
            return Err(ClientError::new("BucketNotEmpty"));
        }
        self.set_exists(false);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>, ClientError> {
        self.check()?;
        Ok(self.object(key))
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), ClientError> {
        self.check()?;
        self.objects.insert(
            key.to_owned(),
            StoredObject {
                body,
                content_type: content_type.map(str::to_owned),
            },
        );
        Ok(())
    }

    /// Lists keys the way `object_store` reports them: a directory marker
    /// loses its trailing `/`.
    fn list_objects(&self, prefix: Option<&str>) -> ObjectStream<'_> {
        let mut items: Vec<Result<ObjectInfo, ClientError>> = self
            .keys()
            .into_iter()
            .filter(|key| prefix.is_none_or(|p| key.starts_with(p)))
            .map(|key| {
                let size = self.objects.get(&key).map_or(0, |o| o.body.len() as u64);
                Ok(ObjectInfo {
                    key: key.trim_end_matches('/').to_owned(),
                    size,
                })
            })
            .collect();
        if let Some(n) = *self.list_fail_after.lock().unwrap() {
            items.truncate(n);
            items.push(Err(injected()));
        }
        stream::iter(items).boxed()
    }

    async fn remove_object(&self, key: &str) -> Result<(), ClientError> {
        self.single_remove_calls.lock().unwrap().push(key.to_owned());
        if self.refused_single.contains(key) {
            return Err(ClientError::new("AccessDenied"));
        }
        self.objects.remove(key);
        Ok(())
    }

    async fn remove_objects(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<RemoveObjectError>, ClientError> {
        self.batch_remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batch_requests.load(Ordering::SeqCst) {
            return Err(injected());
        }
        let mut failures = Vec::new();
        for key in keys {
            if self.refused_in_batch.contains(&key) {
                failures.push(RemoveObjectError {
                    key,
                    reason: "InternalError".into(),
                });
            } else {
                self.objects.remove(&key);
            }
        }
        Ok(failures)
    }
}

/// Hands out one [`MemoryObjectStore`] per bucket name.
#[derive(Default)]
pub struct MemoryClientFactory {
    stores: DashMap<String, Arc<MemoryObjectStore>>,
    fail: AtomicBool,
}

impl MemoryClientFactory {
    /// The store for `bucket`, created empty (and absent) on first use.
    pub fn store(&self, bucket: &str) -> Arc<MemoryObjectStore> {
        self.stores
            .entry(bucket.to_owned())
            .or_insert_with(|| Arc::new(MemoryObjectStore::new(bucket)))
            .clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl ClientFactory for MemoryClientFactory {
    fn connect(&self, config: &S3Config) -> Result<Arc<dyn ObjectStoreClient>, ClientError> {
        if self.fail.load(Ordering::SeqCst) || config.bucket.is_empty() {
            return Err(injected());
        }
        Ok(self.store(&config.bucket))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticRegistry {
    volumes: DashMap<String, PersistentVolume>,
    fail: AtomicBool,
}

impl StaticRegistry {
    pub fn insert(&self, volume: PersistentVolume) {
        self.volumes.insert(volume.name.clone(), volume);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(RegistryError("apiserver unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VolumeRegistry for StaticRegistry {
    async fn get(&self, name: &str) -> Result<Option<PersistentVolume>, RegistryError> {
        self.check()?;
        Ok(self.volumes.get(name).map(|v| v.clone()))
    }

    async fn list(&self) -> Result<Vec<PersistentVolume>, RegistryError> {
        self.check()?;
        let mut volumes: Vec<PersistentVolume> =
            self.volumes.iter().map(|e| e.value().clone()).collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }
}

// ---------------------------------------------------------------------------
// Fuse supervision
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeMounts {
    mounted: DashSet<String>,
    fail_unmount: AtomicBool,
    unmount_calls: AtomicUsize,
}

impl FakeMounts {
    pub fn mount(&self, path: &str) {
        self.mounted.insert(path.to_owned());
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.mounted.contains(path)
    }

    pub fn fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmount_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MountTable for FakeMounts {
    async fn is_mount_point(&self, path: &str) -> bool {
        self.is_mounted(path)
    }

    async fn unmount(&self, path: &str) -> io::Result<()> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(16));
        }
        self.mounted.remove(path);
        Ok(())
    }
}

struct FakeProcess {
    cmdline: String,
    alive: bool,
    exit_after: Option<usize>,
    probes: usize,
}

#[derive(Default)]
pub struct FakeProcesses {
    table: DashMap<i32, FakeProcess>,
}

impl FakeProcesses {
    pub fn spawn(&self, pid: i32, cmdline: &str) {
        self.table.insert(
            pid,
            FakeProcess {
                cmdline: cmdline.to_owned(),
                alive: true,
                exit_after: None,
                probes: 0,
            },
        );
    }

    pub fn set_alive(&self, pid: i32, alive: bool) {
        if let Some(mut p) = self.table.get_mut(&pid) {
            p.alive = alive;
        }
    }

    /// The `n`-th command-line probe finds the process gone.
    pub fn exit_after(&self, pid: i32, n: usize) {
        if let Some(mut p) = self.table.get_mut(&pid) {
            p.exit_after = Some(n);
        }
    }

    pub fn probes(&self, pid: i32) -> usize {
        self.table.get(&pid).map_or(0, |p| p.probes)
    }
}

#[async_trait]
impl ProcessTable for FakeProcesses {
    async fn processes(&self) -> io::Result<Vec<ProcessInfo>> {
        let mut out: Vec<ProcessInfo> = self
            .table
            .iter()
            .map(|e| ProcessInfo {
                pid: *e.key(),
                cmdline: e.value().cmdline.clone(),
            })
            .collect();
        out.sort_by_key(|p| p.pid);
        Ok(out)
    }

    async fn cmdline(&self, pid: i32) -> Option<String> {
        let mut p = self.table.get_mut(&pid)?;
        p.probes += 1;
        match p.exit_after {
            Some(n) if p.probes >= n => None,
            _ => Some(p.cmdline.clone()),
        }
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.table.get(&pid).is_some_and(|p| p.alive)
    }
}

/// Records helper invocations and, by default, marks the mount point
/// mounted as a real helper would.
pub struct RecordingRunner {
    mounts: Arc<FakeMounts>,
    commands: Mutex<Vec<HelperCommand>>,
    marks_mounted: AtomicBool,
    failure: Mutex<Option<io::ErrorKind>>,
}

impl RecordingRunner {
    pub fn new(mounts: Arc<FakeMounts>) -> Self {
        Self {
            mounts,
            commands: Mutex::new(Vec::new()),
            marks_mounted: AtomicBool::new(true),
            failure: Mutex::new(None),
        }
    }

    pub fn set_marks_mounted(&self, marks: bool) {
        self.marks_mounted.store(marks, Ordering::SeqCst);
    }

    pub fn fail_with(&self, kind: io::ErrorKind) {
        *self.failure.lock().unwrap() = Some(kind);
    }

    pub fn commands(&self) -> Vec<HelperCommand> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl HelperRunner for RecordingRunner {
    async fn run(&self, command: &HelperCommand) -> io::Result<()> {
        self.commands.lock().unwrap().push(command.clone());
        if let Some(kind) = *self.failure.lock().unwrap() {
            return Err(io::Error::new(kind, "injected helper failure"));
        }
        if self.marks_mounted.load(Ordering::SeqCst) {
            self.mounts.mount(&command.mount_point);
        }
        Ok(())
    }
}

/// Supervisor over fake mounts and an empty process table.
pub fn supervisor(runner: Arc<RecordingRunner>, mounts: Arc<FakeMounts>) -> FuseSupervisor {
    FuseSupervisor::new(runner, mounts, Arc::new(FakeProcesses::default()))
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// An [`S3Driver`] wired to in-memory collaborators.
pub struct DriverFixture {
    pub registry: Arc<StaticRegistry>,
    pub clients: Arc<MemoryClientFactory>,
    pub mounts: Arc<FakeMounts>,
    pub processes: Arc<FakeProcesses>,
    pub runner: Arc<RecordingRunner>,
    pub driver: S3Driver,
    _credentials: tempfile::TempDir,
}

/// Build a driver around `config`, with credentials written to a scratch
/// directory.
pub fn driver_fixture(mut config: DriverConfig) -> DriverFixture {
    let credentials = tempfile::tempdir().expect("credentials dir");
    config.credentials_dir = credentials.path().to_path_buf();

    let registry = Arc::new(StaticRegistry::default());
    let clients = Arc::new(MemoryClientFactory::default());
    let mounts = Arc::new(FakeMounts::default());
    let processes = Arc::new(FakeProcesses::default());
    let runner = Arc::new(RecordingRunner::new(mounts.clone()));
    let supervisor = Arc::new(FuseSupervisor::new(
        runner.clone(),
        mounts.clone(),
        processes.clone(),
    ));
    let driver = S3Driver::new(config, registry.clone(), clients.clone(), supervisor);
    DriverFixture {
        registry,
        clients,
        mounts,
        processes,
        runner,
        driver,
        _credentials: credentials,
    }
}

/// Connection secrets for `bucket`.
pub fn secrets(bucket: &str) -> Secrets {
    Secrets::from([
        (BUCKET_KEY.to_owned(), bucket.to_owned()),
        (SECRET_ACCESS_KEY_ID.to_owned(), "AKIA".to_owned()),
        (SECRET_SECRET_ACCESS_KEY.to_owned(), "s3cr3t".to_owned()),
    ])
}
