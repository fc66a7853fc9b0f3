//! s3fs-fuse backend (the default).
//!
//! s3fs reads credentials from a password file.  Each bucket gets its own
//! file, `<credentials_dir>/.passwd-s3fs-<bucket>`, so concurrent mounts of
//! different buckets never overwrite each other's keys.  The file is written
//! to a temporary name with mode 0600 and renamed into place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::fuse::{FuseSupervisor, HelperCommand};
use super::{MountDescriptor, Mounter, MounterKind};
use crate::error::CsiError;

const S3FS_CMD: &str = "s3fs";
const CREDENTIALS_MODE: u32 = 0o600;

pub struct S3fsMounter {
    descriptor: MountDescriptor,
    supervisor: Arc<FuseSupervisor>,
    credentials_dir: PathBuf,
}

impl S3fsMounter {
    pub fn new(
        descriptor: MountDescriptor,
        supervisor: Arc<FuseSupervisor>,
        credentials_dir: PathBuf,
    ) -> Self {
        Self {
            descriptor,
            supervisor,
            credentials_dir,
        }
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_dir
            .join(format!(".passwd-s3fs-{}", self.descriptor.bucket))
    }

    async fn write_credentials(&self) -> Result<PathBuf, CsiError> {
        let path = self.credentials_path();
        let failed = |e: std::io::Error| {
            CsiError::internal(format!("write s3fs credentials {}: {e}", path.display()))
        };

        tokio::fs::create_dir_all(&self.credentials_dir)
            .await
            .map_err(failed)?;
        let tmp = self.credentials_dir.join(format!(
            ".passwd-s3fs-{}.{}",
            self.descriptor.bucket,
            uuid::Uuid::new_v4()
        ));
        let contents = format!(
            "{}:{}",
            self.descriptor.access_key_id, self.descriptor.secret_access_key
        );
        if let Err(e) = write_private(&tmp, contents.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(failed(e));
        }
        tokio::fs::rename(&tmp, &path).await.map_err(failed)?;
        debug!(path = %path.display(), "s3fs credentials written");
        Ok(path)
    }

    fn command(&self, target: &str, passwd_file: &Path) -> HelperCommand {
        let d = &self.descriptor;
        let mut cmd = HelperCommand::new(S3FS_CMD, target)
            .arg(format!("{}:/{}", d.bucket, d.prefix))
            .arg(target)
            .arg("-o")
            .arg("use_path_request_style");
        if !d.endpoint.is_empty() {
            cmd = cmd.arg("-o").arg(format!("url={}", d.endpoint));
        }
        cmd.arg("-o")
            .arg(format!("endpoint={}", d.region))
            .arg("-o")
            .arg("allow_other")
            .arg("-o")
            .arg("mp_umask=000")
            .arg("-o")
            .arg(format!("passwd_file={}", passwd_file.display()))
    }
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(CREDENTIALS_MODE)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

#[async_trait]
impl Mounter for S3fsMounter {
    fn kind(&self) -> MounterKind {
        MounterKind::S3fs
    }

    async fn stage(&self, _staging_path: &str) -> Result<(), CsiError> {
        Ok(())
    }

    async fn unstage(&self, _staging_path: &str) -> Result<(), CsiError> {
        Ok(())
    }

    #[instrument(skip_all, fields(bucket = %self.descriptor.bucket, path = %target))]
    async fn mount(&self, _source: &str, target: &str) -> Result<(), CsiError> {
        let passwd_file = self.write_credentials().await?;
        self.supervisor
            .mount(self.command(target, &passwd_file))
            .await?;
        info!("s3fs mounted");
        Ok(())
    }
}
