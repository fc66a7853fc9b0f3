//! goofys backend.  goofys reads the standard AWS environment variables.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::fuse::{FuseSupervisor, HelperCommand};
use super::{MountDescriptor, Mounter, MounterKind};
use crate::error::CsiError;

const GOOFYS_CMD: &str = "goofys";

pub struct GoofysMounter {
    descriptor: MountDescriptor,
    supervisor: Arc<FuseSupervisor>,
}

impl GoofysMounter {
    pub fn new(descriptor: MountDescriptor, supervisor: Arc<FuseSupervisor>) -> Self {
        Self {
            descriptor,
            supervisor,
        }
    }

    fn command(&self, target: &str) -> HelperCommand {
        let d = &self.descriptor;
        let mut cmd = HelperCommand::new(GOOFYS_CMD, target);
        if !d.endpoint.is_empty() {
            cmd = cmd.arg(format!("--endpoint={}", d.endpoint));
        }
        cmd.arg(format!("--region={}", d.region))
            .arg("-o")
            .arg("allow_other")
            .arg(format!("{}:{}", d.bucket, d.prefix))
            .arg(target)
            .env("AWS_ACCESS_KEY_ID", &d.access_key_id)
            .env("AWS_SECRET_ACCESS_KEY", &d.secret_access_key)
    }
}

#[async_trait]
impl Mounter for GoofysMounter {
    fn kind(&self) -> MounterKind {
        MounterKind::Goofys
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
        info!("goofys mounted");
        Ok(())
    }
}
