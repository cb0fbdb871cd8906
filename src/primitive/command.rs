//! Host command execution
//!
//! Runs tooling as argv vectors, optionally inside the host mount namespace
//! through `nsenter`, and turns failed exits into [`Error::Command`].

use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Binary used to enter the host mount namespace
pub const NSENTER_PATH: &str = "/nsenter";

/// Argument selecting the mount namespace of PID 1
pub const NSENTER_MOUNT_NS: &str = "--mount=/proc/1/ns/mnt";

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct HostCommandRunner {
    /// Prefix every command with `nsenter` into the host mount namespace
    host_namespace: bool,
}

impl HostCommandRunner {
    /// Runner executing commands in the current namespace
    pub fn local() -> Self {
        Self {
            host_namespace: false,
        }
    }

    /// Runner executing commands in the host mount namespace
    pub fn host_namespace() -> Self {
        Self {
            host_namespace: true,
        }
    }

    fn argv(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        if self.host_namespace {
            let mut full = Vec::with_capacity(args.len() + 2);
            full.push(NSENTER_MOUNT_NS.to_string());
            full.push(program.to_string());
            full.extend(args.iter().cloned());
            (NSENTER_PATH.to_string(), full)
        } else {
            (program.to_string(), args.to_vec())
        }
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let (binary, argv) = self.argv(program, args);
        debug!("Running {} {}", binary, argv.join(" "));

        let output = Command::new(&binary)
            .args(&argv)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: program.to_string(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an argv vector from string slices
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Run a command and return stdout, failing on a non-zero exit
pub async fn run_checked(runner: &dyn CommandRunner, program: &str, argv: &[String]) -> Result<String> {
    let output = runner.run(program, argv).await?;
    if output.success() {
        Ok(output.stdout)
    } else {
        let reason = if output.stderr.trim().is_empty() {
            format!("exit status {:?}", output.status)
        } else {
            output.stderr.trim().to_string()
        };
        Err(Error::Command {
            command: format!("{} {}", program, argv.join(" ")),
            reason,
        })
    }
}

// =============================================================================
// Test Support
// =============================================================================
