//! rclone backend.  Credentials travel in the helper's environment and are
//! picked up by `--s3-env-auth`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::fuse::{FuseSupervisor, HelperCommand};
use super::{MountDescriptor, Mounter, MounterKind};
use crate::error::CsiError;

const RCLONE_CMD: &str = "rclone";

pub struct RcloneMounter {
    descriptor: MountDescriptor,
    supervisor: Arc<FuseSupervisor>,
}

impl RcloneMounter {
    pub fn new(descriptor: MountDescriptor, supervisor: Arc<FuseSupervisor>) -> Self {
        Self {
            descriptor,
            supervisor,
        }
    }

    fn command(&self, target: &str) -> HelperCommand {
        let d = &self.descriptor;
        let mut cmd = HelperCommand::new(RCLONE_CMD, target)
            .arg("mount")
            .arg(format!(":s3:{}/{}", d.bucket, d.prefix))
            .arg(target)
            .arg("--daemon")
            .arg("--s3-provider=AWS")
            .arg("--s3-env-auth=true");
        if !d.endpoint.is_empty() {
            cmd = cmd.arg(format!("--s3-endpoint={}", d.endpoint));
        }
        cmd.arg(format!("--s3-region={}", d.region))
            .arg("--allow-other")
            .arg("--vfs-cache-mode=writes")
            .env("AWS_ACCESS_KEY_ID", &d.access_key_id)
            .env("AWS_SECRET_ACCESS_KEY", &d.secret_access_key)
    }
}

#[async_trait]
impl Mounter for RcloneMounter {
    fn kind(&self) -> MounterKind {
        MounterKind::Rclone
    }

    async fn stage(&self, _staging_path: &str) -> Result<(), CsiError> {
        Ok(())
    }

    async fn unstage(&self, _staging_path: &str) -> Result<(), CsiError> {
        Ok(())
    }

    #[instrument(skip_all, fields(bucket = %self.descriptor.bucket, path = %target))]
    async fn mount(&self, _source: &str, target: &str) -> Result<(), CsiError> {
        self.supervisor.mount(self.command(target)).await?;
        info!("rclone mounted");
        Ok(())
    }
}
