//! LVM driver
//!
//! Logical volume and volume group operations through the LVM2 tooling.
//! Reports are requested as JSON in bytes and parsed with serde.

use super::command::{args, run_checked};
use crate::domain::ports::CommandRunnerRef;
use crate::domain::volume::PROTECTED_TAG;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

/// Report options shared by `lvs` and `vgs`
const REPORT_ARGS: [&str; 5] = ["--reportformat", "json", "--units", "b", "--nosuffix"];

const LV_FIELDS: &str = "lv_name,vg_name,lv_size,lv_uuid,lv_attr,lv_tags,origin";
const VG_FIELDS: &str = "vg_name,vg_size,vg_free,vg_uuid,vg_tags,pv_count";

// =============================================================================
// Report Types
// =============================================================================

/// Logical volume as reported by `lvs`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogicalVolumeInfo {
    #[serde(rename = "lv_name")]
    pub name: String,
    #[serde(rename = "vg_name", default)]
    pub vg: String,
    #[serde(rename = "lv_size", deserialize_with = "de_size")]
    pub size_bytes: u64,
    #[serde(rename = "lv_uuid", default)]
    pub uuid: String,
    #[serde(rename = "lv_attr", default)]
    pub attr: String,
    #[serde(rename = "lv_tags", default, deserialize_with = "de_tags")]
    pub tags: Vec<String>,
    /// Origin volume when this is a snapshot
    #[serde(default)]
    pub origin: String,
}

/// Volume group as reported by `vgs`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VolumeGroupInfo {
    #[serde(rename = "vg_name")]
    pub name: String,
    #[serde(rename = "vg_size", deserialize_with = "de_size")]
    pub size_bytes: u64,
    #[serde(rename = "vg_free", deserialize_with = "de_size")]
    pub free_bytes: u64,
    #[serde(rename = "vg_uuid", default)]
    pub uuid: String,
    #[serde(rename = "vg_tags", default, deserialize_with = "de_tags")]
    pub tags: Vec<String>,
    #[serde(rename = "pv_count", deserialize_with = "de_size")]
    pub pv_count: u64,
}

impl LogicalVolumeInfo {
    pub fn is_protected(&self) -> bool {
        self.tags.iter().any(|t| t == PROTECTED_TAG)
    }
}

impl VolumeGroupInfo {
    pub fn is_protected(&self) -> bool {
        self.tags.iter().any(|t| t == PROTECTED_TAG)
    }
}

#[derive(Debug, Deserialize)]
struct Report<T> {
    report: Vec<ReportSection<T>>,
}

#[derive(Debug, Deserialize)]
struct ReportSection<T> {
    #[serde(alias = "lv", alias = "vg", default = "Vec::new")]
    rows: Vec<T>,
}

fn de_size<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    let trimmed = raw.trim().trim_end_matches('B');
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(serde::de::Error::custom)
}

fn de_tags<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect())
}

fn parse_report<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<Vec<T>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let report: Report<T> = serde_json::from_str(stdout)?;
    Ok(report.report.into_iter().flat_map(|s| s.rows).collect())
}

/// Map LVM "does not exist" failures onto [`Error::NotFound`]
fn map_missing(err: Error, kind: &str, name: &str) -> Error {
    match &err {
        Error::Command { reason, .. }
            if reason.contains("Failed to find logical volume")
                || reason.contains("not found")
                || reason.contains("not exist") =>
        {
            Error::not_found(kind, name)
        }
        _ => err,
    }
}

// =============================================================================
// LVM Driver
// =============================================================================

/// Driver for LVM2 logical volumes and volume groups
pub struct LvmDriver {
    runner: CommandRunnerRef,
}

impl LvmDriver {
    pub fn new(runner: CommandRunnerRef) -> Self {
        Self { runner }
    }

    // -------------------------------------------------------------------------
    // Logical volumes
    // -------------------------------------------------------------------------

    /// List logical volumes matching `selector` (`vg` or `vg/name`)
    pub async fn list_lv(&self, selector: &str) -> Result<Vec<LogicalVolumeInfo>> {
        let mut argv = args(REPORT_ARGS);
        argv.extend(args(["-o", LV_FIELDS, selector]));
        let stdout = run_checked(self.runner.as_ref(), "lvs", &argv)
            .await
            .map_err(|e| map_missing(e, "lv", selector))?;
        parse_report(&stdout)
    }

    /// Look up one logical volume
    pub async fn get_lv(&self, vg: &str, name: &str) -> Result<Option<LogicalVolumeInfo>> {
        match self.list_lv(&format!("{}/{}", vg, name)).await {
            Ok(lvs) => Ok(lvs.into_iter().find(|lv| lv.name == name)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Live size of a logical volume in bytes
    pub async fn lv_size(&self, vg: &str, name: &str) -> Result<u64> {
        self.get_lv(vg, name)
            .await?
            .map(|lv| lv.size_bytes)
            .ok_or_else(|| Error::not_found("lv", format!("{}/{}", vg, name)))
    }

    /// Create a logical volume of `size_bytes`
    pub async fn create_lv(
        &self,
        vg: &str,
        name: &str,
        size_bytes: u64,
        striped: bool,
        tags: &[String],
    ) -> Result<String> {
        if size_bytes == 0 {
            return Err(Error::InvalidArgument(format!(
                "logical volume {}/{} needs a non-zero size",
                vg, name
            )));
        }

        let mut argv = args(["-v", "-y", "-n", name, "-L"]);
        argv.push(format!("{}b", size_bytes));
        if striped {
            let stripes = self.stripe_count(vg).await?;
            argv.push("-i".into());
            argv.push(stripes.to_string());
        }
        for tag in tags {
            argv.push("--addtag".into());
            argv.push(tag.clone());
        }
        argv.push(vg.to_string());

        info!("Creating logical volume {}/{} ({} bytes)", vg, name, size_bytes);
        run_checked(self.runner.as_ref(), "lvcreate", &argv)
            .await
            .map_err(|e| map_missing(e, "vg", vg))
    }

    /// One stripe per physical volume of the group
    async fn stripe_count(&self, vg: &str) -> Result<u64> {
        let group = self
            .get_vg(vg)
            .await?
            .ok_or_else(|| Error::not_found("vg", vg))?;
        Ok(group.pv_count.max(1))
    }

    /// Remove a logical volume unless it is protected
    pub async fn remove_lv(&self, vg: &str, name: &str) -> Result<String> {
        let lvs = self.list_lv(&format!("{}/{}", vg, name)).await?;
        let lv = match lvs.as_slice() {
            [lv] => lv,
            [] => return Err(Error::not_found("lv", format!("{}/{}", vg, name))),
            _ => {
                return Err(Error::Internal(format!(
                    "expected one logical volume for {}/{}, found {}",
                    vg,
                    name,
                    lvs.len()
                )))
            }
        };
        if lv.is_protected() {
            return Err(Error::Conflict(format!(
                "logical volume {}/{} is tagged {}",
                vg, name, PROTECTED_TAG
            )));
        }

        info!("Removing logical volume {}/{}", vg, name);
        let path = format!("{}/{}", vg, name);
        run_checked(self.runner.as_ref(), "lvremove", &args(["-v", "-f", path.as_str()]))
            .await
        .map_err(|e| map_missing(e, "lv", name))
    }

    /// Grow a logical volume to `size_bytes`
    pub async fn extend_lv(&self, vg: &str, name: &str, size_bytes: u64) -> Result<String> {
        info!("Extending logical volume {}/{} to {} bytes", vg, name, size_bytes);
        let argv = vec![
            "-L".to_string(),
            format!("{}b", size_bytes),
            format!("{}/{}", vg, name),
        ];
        run_checked(self.runner.as_ref(), "lvextend", &argv)
            .await
            .map_err(|e| map_missing(e, "lv", name))
    }

    /// Create a read-only snapshot `name` of `source`
    pub async fn create_snapshot_lv(
        &self,
        vg: &str,
        name: &str,
        source: &str,
        size_bytes: u64,
    ) -> Result<String> {
        if size_bytes == 0 {
            return Err(Error::InvalidArgument(format!(
                "snapshot {}/{} needs a non-zero size",
                vg, name
            )));
        }
        info!(
            "Creating snapshot {}/{} of {} ({} bytes)",
            vg, name, source, size_bytes
        );
        let argv = vec![
            "-s".to_string(),
            "-p".to_string(),
            "r".to_string(),
            "-n".to_string(),
            name.to_string(),
            "-L".to_string(),
            format!("{}b", size_bytes),
            format!("{}/{}", vg, source),
        ];
        run_checked(self.runner.as_ref(), "lvcreate", &argv)
            .await
            .map_err(|e| map_missing(e, "lv", source))
    }

    /// Add tags to a logical volume
    pub async fn add_lv_tags(&self, vg: &str, name: &str, tags: &[String]) -> Result<()> {
        self.change_lv_tags(vg, name, "--addtag", tags).await
    }

    /// Remove tags from a logical volume
    pub async fn remove_lv_tags(&self, vg: &str, name: &str, tags: &[String]) -> Result<()> {
        self.change_lv_tags(vg, name, "--deltag", tags).await
    }

    async fn change_lv_tags(&self, vg: &str, name: &str, flag: &str, tags: &[String]) -> Result<()> {
        let path = format!("{}/{}", vg, name);
        let lvs = self.list_lv(&path).await?;
        if lvs.len() != 1 {
            return Err(Error::not_found("lv", path));
        }
        for tag in tags {
            debug!("lvchange {} {} on {}", flag, tag, path);
            run_checked(
                self.runner.as_ref(),
                "lvchange",
                &args([flag, tag.as_str(), path.as_str()]),
            )
            .await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Volume groups
    // -------------------------------------------------------------------------

    /// List all volume groups
    pub async fn list_vg(&self) -> Result<Vec<VolumeGroupInfo>> {
        let mut argv = args(REPORT_ARGS);
        argv.extend(args(["-o", VG_FIELDS]));
        let stdout = run_checked(self.runner.as_ref(), "vgs", &argv).await?;
        parse_report(&stdout)
    }

    /// Look up one volume group
    pub async fn get_vg(&self, name: &str) -> Result<Option<VolumeGroupInfo>> {
        Ok(self.list_vg().await?.into_iter().find(|vg| vg.name == name))
    }

    /// Whether a volume group exists and passes metadata checks
    pub async fn vg_exists(&self, name: &str) -> Result<bool> {
        let output = self.runner.run("vgck", &args([name])).await?;
        Ok(output.success())
    }

    /// Create a volume group on physical volume `pv`
    pub async fn create_vg(&self, name: &str, pv: &str, tags: &[String]) -> Result<String> {
        let mut argv = args([name, pv, "-v"]);
        for tag in tags {
            argv.push("--addtag".into());
            argv.push(tag.clone());
        }
        info!("Creating volume group {} on {}", name, pv);
        run_checked(self.runner.as_ref(), "vgcreate", &argv).await
    }

    /// Remove a volume group unless it is protected
    pub async fn remove_vg(&self, name: &str) -> Result<String> {
        let vg = self
            .get_vg(name)
            .await?
            .ok_or_else(|| Error::not_found("vg", name))?;
        if vg.is_protected() {
            return Err(Error::Conflict(format!(
                "volume group {} is tagged {}",
                name, PROTECTED_TAG
            )));
        }
        info!("Removing volume group {}", name);
        run_checked(self.runner.as_ref(), "vgremove", &args(["-v", "-f", name]))
            .await
            .map_err(|e| map_missing(e, "vg", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::CommandOutput;
    use crate::primitive::command::testing::ScriptedRunner;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const LVS_ONE: &str = r#"{
        "report": [
            {
                "lv": [
                    {"lv_name":"pv-1", "vg_name":"vg0", "lv_size":"4294967296", "lv_uuid":"abc", "lv_attr":"-wi-a-----", "lv_tags":"owner,app", "origin":""}
                ]
            }
        ]
    }"#;

    const LVS_PROTECTED: &str = r#"{"report":[{"lv":[{"lv_name":"pv-1","vg_name":"vg0","lv_size":"1073741824","lv_uuid":"abc","lv_attr":"-wi-a-----","lv_tags":"protected","origin":""}]}]}"#;

    const VGS: &str = r#"{"report":[{"vg":[
        {"vg_name":"vg0","vg_size":"107374182400","vg_free":"53687091200","vg_uuid":"u1","vg_tags":"","pv_count":"3"},
        {"vg_name":"vg1","vg_size":"10737418240","vg_free":"0","vg_uuid":"u2","vg_tags":"protected","pv_count":"1"}
    ]}]}"#;

    fn driver(runner: ScriptedRunner) -> (LvmDriver, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (LvmDriver::new(runner.clone()), runner)
    }

    #[tokio::test]
    async fn test_list_lv_parses_report() {
        let (lvm, runner) = driver(ScriptedRunner::new(|_, _| CommandOutput::ok(LVS_ONE)));
        let lvs = lvm.list_lv("vg0").await.unwrap();

        assert_eq!(lvs.len(), 1);
        assert_eq!(lvs[0].name, "pv-1");
        assert_eq!(lvs[0].size_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(lvs[0].tags, vec!["owner".to_string(), "app".to_string()]);

        let call = &runner.calls()[0];
        assert_eq!(call[0], "lvs");
        assert!(call.contains(&"json".to_string()));
        assert_eq!(call.last().map(String::as_str), Some("vg0"));
    }

    #[tokio::test]
    async fn test_get_lv_missing_is_none() {
        let (lvm, _) = driver(ScriptedRunner::new(|_, _| {
            CommandOutput::failed(5, "  Failed to find logical volume \"vg0/pv-9\"")
        }));
        assert_eq!(lvm.get_lv("vg0", "pv-9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_lv_rejects_zero_size() {
        let (lvm, runner) = driver(ScriptedRunner::new(|_, _| CommandOutput::ok("")));
        let err = lvm.create_lv("vg0", "pv-1", 0, false, &[]).await.unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_striped_lv_uses_pv_count() {
        let (lvm, runner) = driver(ScriptedRunner::new(|program, _| match program {
            "vgs" => CommandOutput::ok(VGS),
            _ => CommandOutput::ok("Logical volume \"pv-1\" created."),
        }));

        lvm.create_lv("vg0", "pv-1", 1024, true, &["owner".to_string()])
            .await
            .unwrap();

        let create = &runner.calls_to("lvcreate")[0];
        assert_eq!(
            create[1..],
            args(["-v", "-y", "-n", "pv-1", "-L", "1024b", "-i", "3", "--addtag", "owner", "vg0"])[..]
        );
    }

    #[tokio::test]
    async fn test_remove_protected_lv_is_conflict() {
        let (lvm, runner) = driver(ScriptedRunner::new(|_, _| CommandOutput::ok(LVS_PROTECTED)));
        let err = lvm.remove_lv("vg0", "pv-1").await.unwrap_err();
        assert_matches!(err, Error::Conflict(_));
        assert!(runner.calls_to("lvremove").is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_lv_is_not_found() {
        let (lvm, _) = driver(ScriptedRunner::new(|_, _| {
            CommandOutput::failed(5, "Failed to find logical volume \"vg0/pv-1\"")
        }));
        let err = lvm.remove_lv("vg0", "pv-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_snapshot_command() {
        let (lvm, runner) = driver(ScriptedRunner::new(|_, _| CommandOutput::ok("")));
        lvm.create_snapshot_lv("vg0", "snap-1", "pv-1", 5 * 1024)
            .await
            .unwrap();
        assert_eq!(
            runner.calls()[0],
            args(["lvcreate", "-s", "-p", "r", "-n", "snap-1", "-L", "5120b", "vg0/pv-1"])
        );
    }

    #[tokio::test]
    async fn test_volume_groups() {
        let (lvm, runner) = driver(ScriptedRunner::new(|program, _| match program {
            "vgs" => CommandOutput::ok(VGS),
            "vgck" => CommandOutput::failed(5, "Volume group \"vg9\" not found"),
            _ => CommandOutput::ok(""),
        }));

        let vgs = lvm.list_vg().await.unwrap();
        assert_eq!(vgs.len(), 2);
        assert_eq!(vgs[0].free_bytes, 50 * 1024 * 1024 * 1024);

        assert!(!lvm.vg_exists("vg9").await.unwrap());
        assert_matches!(lvm.remove_vg("vg1").await, Err(Error::Conflict(_)));
        assert!(lvm.remove_vg("vg9").await.unwrap_err().is_not_found());

        lvm.remove_vg("vg0").await.unwrap();
        assert_eq!(runner.calls_to("vgremove")[0], args(["vgremove", "-v", "-f", "vg0"]));
    }
}
