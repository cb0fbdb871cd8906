//! Persistent memory driver
//!
//! fsdax namespaces managed with `ndctl`, whose output is JSON.

use super::command::{args, run_checked};
use crate::domain::ports::CommandRunnerRef;
use crate::error::{Error, Result};
use serde::Deserialize;
use tracing::info;

/// Namespace as reported by `ndctl`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PmemNamespace {
    /// Namespace device, e.g. `namespace0.0`
    pub dev: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Block device, e.g. `pmem0`
    #[serde(default)]
    pub blockdev: Option<String>,
}

/// `ndctl` prints a bare object when exactly one namespace matches
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<PmemNamespace>),
    One(PmemNamespace),
}

fn parse_namespaces(stdout: &str) -> Result<Vec<PmemNamespace>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_str(stdout)? {
        OneOrMany::Many(list) => list,
        OneOrMany::One(ns) => vec![ns],
    })
}

/// Driver for persistent memory namespaces
pub struct PmemDriver {
    runner: CommandRunnerRef,
}

impl PmemDriver {
    pub fn new(runner: CommandRunnerRef) -> Self {
        Self { runner }
    }

    /// List namespaces of `region`
    pub async fn list_namespaces(&self, region: &str) -> Result<Vec<PmemNamespace>> {
        let stdout =
            run_checked(self.runner.as_ref(), "ndctl", &args(["list", "-N", "-r", region])).await?;
        parse_namespaces(&stdout)
    }

    /// Look up a namespace by name
    pub async fn get_namespace(&self, region: &str, name: &str) -> Result<Option<PmemNamespace>> {
        Ok(self
            .list_namespaces(region)
            .await?
            .into_iter()
            .find(|ns| ns.name.as_deref() == Some(name)))
    }

    /// Create an fsdax namespace of `size_bytes` named `name`
    pub async fn create_namespace(
        &self,
        region: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<PmemNamespace> {
        if size_bytes == 0 {
            return Err(Error::InvalidArgument(format!(
                "pmem namespace {}/{} needs a non-zero size",
                region, name
            )));
        }
        info!(
            "Creating pmem namespace {} in {} ({} bytes)",
            name, region, size_bytes
        );
        let size = size_bytes.to_string();
        let stdout = run_checked(
            self.runner.as_ref(),
            "ndctl",
            &args([
                "create-namespace",
                "-r",
                region,
                "-s",
                size.as_str(),
                "-n",
                name,
                "-m",
                "fsdax",
            ]),
        )
        .await?;

        parse_namespaces(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal(format!("ndctl returned no namespace for {}", name)))
    }

    /// Destroy namespace device `dev`
    pub async fn delete_namespace(&self, dev: &str) -> Result<()> {
        info!("Destroying pmem namespace {}", dev);
        run_checked(
            self.runner.as_ref(),
            "ndctl",
            &args(["destroy-namespace", "-f", dev]),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::CommandOutput;
    use crate::primitive::command::testing::ScriptedRunner;
    use std::sync::Arc;

    const ONE: &str = r#"{"dev":"namespace0.0","mode":"fsdax","size":4225761280,"uuid":"u-1","name":"pv-1","blockdev":"pmem0"}"#;
    const MANY: &str = r#"[
        {"dev":"namespace0.0","mode":"fsdax","size":4225761280,"name":"pv-1","blockdev":"pmem0"},
        {"dev":"namespace0.1","mode":"fsdax","size":8451522560,"name":"pv-2","blockdev":"pmem0.1"}
    ]"#;

    #[tokio::test]
    async fn test_get_namespace_from_single_object() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| CommandOutput::ok(ONE)));
        let pmem = PmemDriver::new(runner);

        let ns = pmem.get_namespace("region0", "pv-1").await.unwrap().unwrap();
        assert_eq!(ns.dev, "namespace0.0");
        assert_eq!(ns.blockdev.as_deref(), Some("pmem0"));
        assert!(pmem.get_namespace("region0", "pv-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_and_empty() {
        let runner = Arc::new(ScriptedRunner::new(|_, args| {
            if args.iter().any(|a| a == "region1") {
                CommandOutput::ok("")
            } else {
                CommandOutput::ok(MANY)
            }
        }));
        let pmem = PmemDriver::new(runner);

        assert_eq!(pmem.list_namespaces("region0").await.unwrap().len(), 2);
        assert!(pmem.list_namespaces("region1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_namespace_fsdax() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| CommandOutput::ok(ONE)));
        let pmem = PmemDriver::new(runner.clone());

        let ns = pmem.create_namespace("region0", "pv-1", 4 << 30).await.unwrap();
        assert_eq!(ns.name.as_deref(), Some("pv-1"));

        let call = &runner.calls()[0];
        assert_eq!(call[1], "create-namespace");
        assert!(call.windows(2).any(|w| w[0] == "-m" && w[1] == "fsdax"));
        assert!(call.windows(2).any(|w| w[0] == "-s" && w[1] == (4u64 << 30).to_string()));
    }
}
