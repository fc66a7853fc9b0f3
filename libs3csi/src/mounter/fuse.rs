//! FUSE helper supervision.
//!
//! Mounting runs the backend's helper binary and then polls the mount table
//! until the target shows up (10 s ceiling, 10 ms interval).
//!
//! Unmounting issues `umount(2)` and then waits for the helper that served
//! the target to go away.  The helper is re-discovered from the process
//! table by its command line; nothing is recorded at mount time, since the
//! helpers daemonize and the pid we spawned is not the one that stays.
//! The wait probes every 2 s, at most 60 times, and fails with
//! [`CsiError::UnmountTimeout`] if the process is still alive after that.

use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};

use crate::error::CsiError;

/// How long a freshly started helper has to make the target a mount point.
pub const MOUNT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Spacing of liveness probes while waiting for a helper to exit.
pub const PROCESS_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Probes before giving up on a helper that will not exit.
pub const PROCESS_POLL_LIMIT: u32 = 60;

/// One invocation of a mount helper.
#[derive(Clone, PartialEq, Eq)]
pub struct HelperCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment, typically credentials.
    pub envs: Vec<(String, String)>,
    /// Path that becomes a mount point once the helper succeeds.
    pub mount_point: String,
}

impl HelperCommand {
    pub fn new(program: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            mount_point: mount_point.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl fmt::Debug for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("HelperCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("mount_point", &self.mount_point)
            .finish()
    }
}

/// Runs helper binaries.
#[async_trait]
pub trait HelperRunner: Send + Sync {
    /// Run `command` to completion.  A missing binary is reported as
    /// [`io::ErrorKind::NotFound`]; a non-zero exit as any other error.
    async fn run(&self, command: &HelperCommand) -> io::Result<()>;
}

/// The kernel's view of mounted filesystems.
#[async_trait]
pub trait MountTable: Send + Sync {
    async fn is_mount_point(&self, path: &str) -> bool;

    /// Unmount `path`.  A path that is not mounted is not an error.
    async fn unmount(&self, path: &str) -> io::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    /// Arguments joined by single spaces.
    pub cmdline: String,
}

/// Read-only view of the OS process table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn processes(&self) -> io::Result<Vec<ProcessInfo>>;

    /// Current command line of `pid`, `None` once the process is gone.
    async fn cmdline(&self, pid: i32) -> Option<String>;

    /// Signal-0 liveness probe.
    fn is_alive(&self, pid: i32) -> bool;
}

// ---------------------------------------------------------------------------
// Production implementations
// ---------------------------------------------------------------------------

/// Spawns helpers with `tokio::process`.
///
/// stdio is inherited: s3fs and rclone fork a daemon that keeps any piped
/// descriptors open, so waiting on captured output would never finish.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl HelperRunner for SystemRunner {
    async fn run(&self, command: &HelperCommand) -> io::Result<()> {
        let status = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "{} exited with {status}",
                command.program
            )))
        }
    }
}

/// `/proc/self/mounts` plus `umount(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounts;

#[async_trait]
impl MountTable for SystemMounts {
    /// CSI target paths never contain whitespace, so the octal escapes of
    /// `/proc/self/mounts` can be ignored.
    async fn is_mount_point(&self, path: &str) -> bool {
        let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
            Ok(c) => c,
            Err(_) => return false,
        };
        let path = normalize(path);
        // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
        contents
            .lines()
            .any(|line| line.split_whitespace().nth(1).map(normalize) == Some(path))
    }

    async fn unmount(&self, path: &str) -> io::Result<()> {
        match nix::mount::umount(path) {
            Ok(()) => Ok(()),
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                debug!(path, "not mounted, skipping umount");
                Ok(())
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Process table backed by `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcTable;

async fn read_cmdline(pid: i32) -> Option<String> {
    let raw = tokio::fs::read(format!("/proc/{pid}/cmdline")).await.ok()?;
    let joined = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ");
    Some(joined)
}

#[async_trait]
impl ProcessTable for ProcTable {
    async fn processes(&self) -> io::Result<Vec<ProcessInfo>> {
        let mut dir = tokio::fs::read_dir("/proc").await?;
        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            // Processes can exit between the listing and the read.
            if let Some(cmdline) = read_cmdline(pid).await {
                out.push(ProcessInfo { pid, cmdline });
            }
        }
        Ok(out)
    }

    async fn cmdline(&self, pid: i32) -> Option<String> {
        read_cmdline(pid).await
    }

    fn is_alive(&self, pid: i32) -> bool {
        match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            // Exists, but owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// FuseSupervisor
// ---------------------------------------------------------------------------

/// Drives mount helpers and tears their mounts down again.
pub struct FuseSupervisor {
    runner: Arc<dyn HelperRunner>,
    mounts: Arc<dyn MountTable>,
    processes: Arc<dyn ProcessTable>,
}

impl FuseSupervisor {
    pub fn new(
        runner: Arc<dyn HelperRunner>,
        mounts: Arc<dyn MountTable>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            runner,
            mounts,
            processes,
        }
    }

    /// Supervisor over the host's real process and mount tables.
    pub fn system() -> Self {
        Self::new(
            Arc::new(SystemRunner),
            Arc::new(SystemMounts),
            Arc::new(ProcTable),
        )
    }

    pub fn mounts(&self) -> &dyn MountTable {
        self.mounts.as_ref()
    }

    /// Run `command` and wait for its mount point to appear.
    #[instrument(skip_all, fields(program = %command.program, path = %command.mount_point))]
    pub async fn mount(&self, command: HelperCommand) -> Result<(), CsiError> {
        let target = command.mount_point.clone();
        self.runner.run(&command).await.map_err(|e| {
            let reason = if e.kind() == io::ErrorKind::NotFound {
                format!("mount helper `{}` is not installed", command.program)
            } else {
                e.to_string()
            };
            CsiError::MountFailed {
                path: target.clone(),
                reason,
            }
        })?;
        self.wait_for_mount(&target).await?;
        info!("mount helper ready");
        Ok(())
    }

    /// Poll until `path` is a mount point, failing after
    /// [`MOUNT_WAIT_TIMEOUT`].
    pub async fn wait_for_mount(&self, path: &str) -> Result<(), CsiError> {
        let poll = async {
            while !self.mounts.is_mount_point(path).await {
                tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(MOUNT_WAIT_TIMEOUT, poll)
            .await
            .map_err(|_| CsiError::MountTimeout {
                path: path.to_owned(),
                timeout_ms: MOUNT_WAIT_TIMEOUT.as_millis() as u64,
            })
    }

    /// Unmount `target` and wait for its helper process to exit.
    #[instrument(skip(self))]
    pub async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        self.mounts
            .unmount(target)
            .await
            .map_err(|e| CsiError::UnmountFailed {
                path: target.to_owned(),
                reason: e.to_string(),
            })?;

        match self.find_mount_process(target).await? {
            Some(pid) => self.wait_for_process(pid, target).await,
            None => {
                warn!("no mount helper process found for target, assuming already gone");
                Ok(())
            }
        }
    }

    /// Pid of the process whose command line has `target` as one of its
    /// arguments.
    pub async fn find_mount_process(&self, target: &str) -> Result<Option<i32>, CsiError> {
        let processes = self
            .processes
            .processes()
            .await
            .map_err(|e| CsiError::internal(format!("list processes: {e}")))?;
        Ok(processes
            .into_iter()
            .find(|p| p.cmdline.split_whitespace().any(|arg| arg == target))
            .map(|p| p.pid))
    }

    /// Wait for `pid` to exit, probing every [`PROCESS_POLL_INTERVAL`] at most
    /// [`PROCESS_POLL_LIMIT`] times.
    pub async fn wait_for_process(&self, pid: i32, target: &str) -> Result<(), CsiError> {
        for attempt in 1..=PROCESS_POLL_LIMIT {
            let gone = match self.processes.cmdline(pid).await {
                None => true,
                Some(cmdline) => cmdline.is_empty() || !self.processes.is_alive(pid),
            };
            if gone {
                debug!(pid, attempt, "mount helper exited");
                return Ok(());
            }
            debug!(pid, attempt, "mount helper still running");
            tokio::time::sleep(PROCESS_POLL_INTERVAL).await;
        }
        Err(CsiError::UnmountTimeout {
            path: target.to_owned(),
            pid,
        })
    }
}
