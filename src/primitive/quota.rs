//! Project quota driver
//!
//! Sub-directories of a quota-enabled filesystem, each tagged with its own
//! project id and limited with `setquota -P`.

use super::command::{args, run_checked};
use crate::domain::ports::CommandRunnerRef;
use crate::domain::volume::validate_path_component;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{info, warn};

/// First project id handed out
pub const PROJECT_ID_BASE: u32 = 10000;

/// Quota-limited sub-directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSubpath {
    pub path: String,
    pub project_id: u32,
}

fn map_missing(err: Error, path: &str) -> Error {
    match &err {
        Error::Command { reason, .. } if reason.contains("No such file or directory") => {
            Error::not_found("quota path", path)
        }
        _ => err,
    }
}

/// Parse `lsattr -p` lines into `(project_id, path)`
fn parse_lsattr(stdout: &str) -> Vec<(u32, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.parse().ok()?;
            let _flags = fields.next()?;
            let path = fields.collect::<Vec<_>>().join(" ");
            Some((id, path))
        })
        .collect()
}

/// Driver for project-quota sub-directories
pub struct QuotaDriver {
    runner: CommandRunnerRef,
}

impl QuotaDriver {
    pub fn new(runner: CommandRunnerRef) -> Self {
        Self { runner }
    }

    /// Full path of subpath `name` under `root`
    ///
    /// `name` must be a single path component so the result stays under
    /// `root`.
    pub fn subpath(root: &str, name: &str) -> Result<String> {
        if !root.starts_with('/') {
            return Err(Error::InvalidArgument(format!(
                "quota root {} is not an absolute path",
                root
            )));
        }
        validate_path_component(name)?;
        Ok(Path::new(root).join(name).to_string_lossy().into_owned())
    }

    /// Look up a subpath carrying its own project id
    ///
    /// A directory left untagged by an interrupted create is reported as
    /// absent so the create is repeated.
    pub async fn get_subpath(&self, root: &str, name: &str) -> Result<Option<QuotaSubpath>> {
        let path = Self::subpath(root, name)?;
        match self.project_id(&path).await {
            Ok(project_id) if project_id >= PROJECT_ID_BASE => {
                Ok(Some(QuotaSubpath { path, project_id }))
            }
            Ok(project_id) => {
                warn!("{} exists with project id {}, not yet tagged", path, project_id);
                Ok(None)
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn project_id(&self, path: &str) -> Result<u32> {
        let stdout = run_checked(self.runner.as_ref(), "lsattr", &args(["-p", "-d", path]))
            .await
            .map_err(|e| map_missing(e, path))?;
        parse_lsattr(&stdout)
            .first()
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::Internal(format!("no project id reported for {}", path)))
    }

    /// Project id of a tagged subpath
    async fn tagged_project_id(&self, path: &str) -> Result<u32> {
        let project_id = self.project_id(path).await?;
        if project_id < PROJECT_ID_BASE {
            return Err(Error::Internal(format!(
                "{} carries project id {}, not one of ours",
                path, project_id
            )));
        }
        Ok(project_id)
    }

    /// Next project id not used under `root`
    async fn next_project_id(&self, root: &str) -> Result<u32> {
        let stdout = run_checked(self.runner.as_ref(), "lsattr", &args(["-p", root]))
            .await
            .map_err(|e| map_missing(e, root))?;
        let highest = parse_lsattr(&stdout)
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| *id >= PROJECT_ID_BASE)
            .max();
        Ok(highest.map_or(PROJECT_ID_BASE, |id| id + 1))
    }

    /// Create subpath `name` under `root` with a fresh project id
    pub async fn create_subpath(&self, root: &str, name: &str) -> Result<QuotaSubpath> {
        let path = Self::subpath(root, name)?;
        let exists = match self.project_id(&path).await {
            Ok(project_id) if project_id >= PROJECT_ID_BASE => {
                return Ok(QuotaSubpath { path, project_id })
            }
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        let project_id = self.next_project_id(root).await?;
        let id = project_id.to_string();

        if exists {
            info!("Tagging existing quota path {} with project id {}", path, project_id);
        } else {
            info!("Creating quota path {} with project id {}", path, project_id);
            run_checked(self.runner.as_ref(), "mkdir", &args(["-p", path.as_str()])).await?;
        }
        run_checked(
            self.runner.as_ref(),
            "chattr",
            &args(["+P", "-p", id.as_str(), path.as_str()]),
        )
        .await?;

        Ok(QuotaSubpath { path, project_id })
    }

    /// Set soft and hard block limits in KiB on `path`
    pub async fn set_quota(&self, path: &str, soft_kib: u64, hard_kib: u64) -> Result<()> {
        let project_id = self.tagged_project_id(path).await?;
        let mount = self.mount_point(path).await?;

        info!(
            "Setting quota on {} (project {}): soft {} KiB, hard {} KiB",
            path, project_id, soft_kib, hard_kib
        );
        let argv = vec![
            "-P".to_string(),
            project_id.to_string(),
            soft_kib.to_string(),
            hard_kib.to_string(),
            "0".to_string(),
            "0".to_string(),
            mount,
        ];
        run_checked(self.runner.as_ref(), "setquota", &argv).await?;
        Ok(())
    }

    /// Filesystem mount point containing `path`
    async fn mount_point(&self, path: &str) -> Result<String> {
        let stdout = run_checked(
            self.runner.as_ref(),
            "findmnt",
            &args(["-n", "-o", "TARGET", "--target", path]),
        )
        .await?;
        let target = stdout.trim();
        if target.is_empty() {
            return Err(Error::Internal(format!("no mount point found for {}", path)));
        }
        Ok(target.to_string())
    }

    /// Clear the quota of `path` and remove it
    pub async fn remove_subpath(&self, path: &str) -> Result<()> {
        if self.project_id(path).await? >= PROJECT_ID_BASE {
            self.set_quota(path, 0, 0).await?;
        }
        info!("Removing quota path {}", path);
        run_checked(self.runner.as_ref(), "rm", &args(["-rf", path])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::CommandOutput;
    use crate::primitive::command::testing::ScriptedRunner;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn runner() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(|program, args| match program {
            "lsattr" if args.iter().any(|a| a == "-d") => {
                let path = args.last().cloned().unwrap_or_default();
                if path.ends_with("pv-1") {
                    CommandOutput::ok(format!("10001 --------------e----P-- {}\n", path))
                } else if path.ends_with("pv-half") {
                    CommandOutput::ok(format!("0 --------------e------- {}\n", path))
                } else {
                    CommandOutput::failed(
                        1,
                        format!("lsattr: No such file or directory while trying to stat {}", path),
                    )
                }
            }
            "lsattr" => CommandOutput::ok(
                "10000 --------------e----P-- /mnt/quota/a\n\
                 10003 --------------e----P-- /mnt/quota/b\n\
                 0 --------------e------- /mnt/quota/lost+found\n",
            ),
            "findmnt" => CommandOutput::ok("/mnt/quota\n"),
            _ => CommandOutput::ok(""),
        }))
    }

    #[test]
    fn test_parse_lsattr() {
        let parsed = parse_lsattr("10001 ----P-- /mnt/quota/with space\n\ngarbage\n");
        assert_eq!(parsed, vec![(10001, "/mnt/quota/with space".to_string())]);
    }

    #[tokio::test]
    async fn test_create_subpath_allocates_next_id() {
        let runner = runner();
        let quota = QuotaDriver::new(runner.clone());

        let sub = quota.create_subpath("/mnt/quota", "pv-2").await.unwrap();
        assert_eq!(sub.project_id, 10004);
        assert_eq!(sub.path, "/mnt/quota/pv-2");
        assert_eq!(
            runner.calls_to("chattr")[0],
            args(["chattr", "+P", "-p", "10004", "/mnt/quota/pv-2"])
        );
    }

    #[tokio::test]
    async fn test_create_existing_subpath_is_noop() {
        let runner = runner();
        let quota = QuotaDriver::new(runner.clone());

        let sub = quota.create_subpath("/mnt/quota", "pv-1").await.unwrap();
        assert_eq!(sub.project_id, 10001);
        assert!(runner.calls_to("mkdir").is_empty());
    }

    #[tokio::test]
    async fn test_set_quota() {
        let runner = runner();
        let quota = QuotaDriver::new(runner.clone());

        quota.set_quota("/mnt/quota/pv-1", 1024, 1024).await.unwrap();
        assert_eq!(
            runner.calls_to("setquota")[0],
            args(["setquota", "-P", "10001", "1024", "1024", "0", "0", "/mnt/quota"])
        );
    }

    #[tokio::test]
    async fn test_untagged_directory_is_tagged_on_retry() {
        let runner = runner();
        let quota = QuotaDriver::new(runner.clone());

        assert_eq!(quota.get_subpath("/mnt/quota", "pv-half").await.unwrap(), None);

        let sub = quota.create_subpath("/mnt/quota", "pv-half").await.unwrap();
        assert_eq!(sub.project_id, 10004);
        assert!(runner.calls_to("mkdir").is_empty());
        assert_eq!(
            runner.calls_to("chattr"),
            vec![args(["chattr", "+P", "-p", "10004", "/mnt/quota/pv-half"])]
        );
    }

    #[tokio::test]
    async fn test_quota_refused_on_untagged_directory() {
        let runner = runner();
        let quota = QuotaDriver::new(runner.clone());

        assert_matches!(
            quota.set_quota("/mnt/quota/pv-half", 1024, 1024).await,
            Err(Error::Internal(_))
        );
        assert!(runner.calls_to("setquota").is_empty());

        quota.remove_subpath("/mnt/quota/pv-half").await.unwrap();
        assert!(runner.calls_to("setquota").is_empty());
        assert_eq!(
            runner.calls_to("rm"),
            vec![args(["rm", "-rf", "/mnt/quota/pv-half"])]
        );
    }

    #[tokio::test]
    async fn test_names_cannot_leave_the_root() {
        let runner = runner();
        let quota = QuotaDriver::new(runner.clone());

        assert_eq!(QuotaDriver::subpath("/mnt/quota", "pv-1").unwrap(), "/mnt/quota/pv-1");
        for name in ["/etc", "../../etc", "a/b", "..", ""] {
            assert_matches!(
                QuotaDriver::subpath("/mnt/quota", name),
                Err(Error::InvalidArgument(_))
            );
            assert_matches!(
                quota.create_subpath("/mnt/quota", name).await,
                Err(Error::InvalidArgument(_))
            );
        }
        assert_matches!(
            QuotaDriver::subpath("mnt/quota", "pv-1"),
            Err(Error::InvalidArgument(_))
        );
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_subpath() {
        let quota = QuotaDriver::new(runner());
        let err = quota.remove_subpath("/mnt/quota/pv-9").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
