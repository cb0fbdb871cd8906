//! Host mounter
//!
//! [`Mounter`] over the usual util-linux and e2fsprogs tooling. The mount
//! table is read with `findmnt`, signatures with `blkid`.

use crate::domain::ports::{CommandRunnerRef, Mounter};
use crate::error::{Error, Result};
use crate::primitive::command::{args, run_checked};
use async_trait::async_trait;
use tracing::{debug, info};

/// Mounter running host commands through a [`crate::domain::ports::CommandRunner`]
pub struct HostMounter {
    runner: CommandRunnerRef,
}

impl HostMounter {
    pub fn new(runner: CommandRunnerRef) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Mounter for HostMounter {
    async fn is_mounted(&self, target: &str) -> Result<bool> {
        if !tokio::fs::try_exists(target).await? {
            return Err(Error::not_found("path", target));
        }
        let output = self
            .runner
            .run("findmnt", &args(["-n", "-o", "TARGET", "--mountpoint", target]))
            .await?;
        match output.status {
            Some(0) => Ok(!output.stdout.trim().is_empty()),
            Some(1) => Ok(false),
            _ => Err(Error::Command {
                command: format!("findmnt --mountpoint {}", target),
                reason: output.stderr.trim().to_string(),
            }),
        }
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<()> {
        let mut argv = Vec::new();
        if let Some(fs) = fs_type {
            argv.extend(args(["-t", fs]));
        }
        if !options.is_empty() {
            argv.push("-o".to_string());
            argv.push(options.join(","));
        }
        argv.extend(args([source, target]));

        run_checked(self.runner.as_ref(), "mount", &argv).await?;
        info!("Mounted {} at {} ({})", source, target, options.join(","));
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        run_checked(self.runner.as_ref(), "umount", &args([target])).await?;
        info!("Unmounted {}", target);
        Ok(())
    }

    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>> {
        let output = self
            .runner
            .run("blkid", &args(["-p", "-s", "TYPE", "-o", "value", device]))
            .await?;
        match output.status {
            Some(0) => {
                let fs = output.stdout.trim();
                Ok((!fs.is_empty()).then(|| fs.to_string()))
            }
            // no recognisable signature
            Some(2) => Ok(None),
            _ => Err(Error::Command {
                command: format!("blkid -p {}", device),
                reason: output.stderr.trim().to_string(),
            }),
        }
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        info!("Formatting {} as {}", device, fs_type);
        run_checked(self.runner.as_ref(), "mkfs", &args(["-t", fs_type, device])).await?;
        Ok(())
    }

    async fn resize_filesystem(&self, device: &str, mount_path: &str) -> Result<()> {
        let fs = self.probe_filesystem(device).await?.ok_or_else(|| {
            Error::Internal(format!("no filesystem on {} to resize", device))
        })?;
        debug!("Resizing {} filesystem on {}", fs, device);
        match fs.as_str() {
            "ext2" | "ext3" | "ext4" => {
                run_checked(self.runner.as_ref(), "resize2fs", &args([device])).await?;
            }
            "xfs" => {
                run_checked(self.runner.as_ref(), "xfs_growfs", &args([mount_path])).await?;
            }
            other => {
                return Err(Error::Unimplemented(format!(
                    "online resize of {} filesystems",
                    other
                )))
            }
        }
        info!("Resized {} filesystem on {}", fs, device);
        Ok(())
    }

    async fn ensure_directory(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn ensure_file(&self, path: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        debug!("Block target {} is in place", path);
        Ok(())
    }
}
