//! Capacity-Primitive Driver
//!
//! Node-local operations on logical volumes, volume groups, raw devices,
//! mount points, persistent memory namespaces and quota paths. Every read
//! is a live query against the host tooling.
//!
//! [`PrimitiveDriver`] is the local [`NodeAgent`]: the agent server exposes
//! it to the controller and the node engine calls it in-process.

pub mod command;
pub mod lvm;
pub mod pmem;
pub mod quota;

pub use command::HostCommandRunner;
pub use lvm::{LogicalVolumeInfo, LvmDriver, VolumeGroupInfo};
pub use pmem::{PmemDriver, PmemNamespace};
pub use quota::{QuotaDriver, QuotaSubpath};

use crate::domain::ports::{CommandRunnerRef, NodeAgent};
use crate::domain::volume::{primitive_attrs, quota_kib, CreateOptions, Primitive, PrimitiveRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use command::{args, run_checked};
use std::sync::Arc;
use tracing::{debug, info};

const BLOCK_DEVICE_KIND: &str = "block special file";
const DIRECTORY_KIND: &str = "directory";

/// Driver for every capacity primitive on this node
pub struct PrimitiveDriver {
    runner: CommandRunnerRef,
    lvm: LvmDriver,
    pmem: PmemDriver,
    quota: QuotaDriver,
}

impl PrimitiveDriver {
    /// Create a driver running its tooling through `runner`
    pub fn new(runner: CommandRunnerRef) -> Arc<Self> {
        Arc::new(Self {
            lvm: LvmDriver::new(runner.clone()),
            pmem: PmemDriver::new(runner.clone()),
            quota: QuotaDriver::new(runner.clone()),
            runner,
        })
    }

    /// File type of `path` as printed by `stat`, `None` if it does not exist
    async fn file_kind(&self, path: &str) -> Result<Option<String>> {
        match run_checked(self.runner.as_ref(), "stat", &args(["-L", "-c", "%F", path])).await {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(Error::Command { reason, .. }) if reason.contains("No such file or directory") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Validate that a pool path exists with the expected file type
    async fn existing_path(
        &self,
        target: &PrimitiveRef,
        path: &str,
        expected: &str,
    ) -> Result<Option<Primitive>> {
        match self.file_kind(path).await? {
            None => Ok(None),
            Some(kind) if kind == expected => Ok(Some(Primitive::new(target.clone()))),
            Some(kind) => Err(Error::InvalidArgument(format!(
                "{} is a {}, expected a {}",
                path, kind, expected
            ))),
        }
    }

    async fn get_logical_volume(&self, vg: &str, name: &str) -> Result<Option<Primitive>> {
        Ok(self.lvm.get_lv(vg, name).await?.map(|lv| lv_primitive(vg, lv)))
    }

    async fn require_logical_volume(&self, vg: &str, name: &str) -> Result<Primitive> {
        self.get_logical_volume(vg, name)
            .await?
            .ok_or_else(|| Error::Internal(format!("logical volume {}/{} missing after create", vg, name)))
    }
}

fn lv_primitive(vg: &str, lv: LogicalVolumeInfo) -> Primitive {
    let mut primitive = Primitive::new(PrimitiveRef::LogicalVolume {
        vg: vg.to_string(),
        name: lv.name,
    });
    primitive.size_bytes = lv.size_bytes;
    primitive.uuid = Some(lv.uuid).filter(|u| !u.is_empty());
    primitive.tags = lv.tags;
    if !lv.origin.is_empty() {
        primitive
            .attributes
            .insert(primitive_attrs::ORIGIN.into(), lv.origin);
    }
    primitive
}

fn pmem_primitive(region: &str, name: &str, ns: PmemNamespace) -> Primitive {
    let mut primitive = Primitive::new(PrimitiveRef::PmemNamespace {
        region: region.to_string(),
        name: name.to_string(),
    });
    primitive.size_bytes = ns.size;
    primitive.uuid = ns.uuid;
    primitive
        .attributes
        .insert(primitive_attrs::PMEM_DEV.into(), ns.dev);
    if let Some(blockdev) = ns.blockdev {
        primitive
            .attributes
            .insert(primitive_attrs::PMEM_BLOCK_DEV.into(), blockdev);
    }
    primitive
}

fn quota_primitive(root: &str, name: &str, sub: QuotaSubpath) -> Primitive {
    let mut primitive = Primitive::new(PrimitiveRef::QuotaPath {
        root: root.to_string(),
        name: name.to_string(),
    });
    primitive
        .attributes
        .insert(primitive_attrs::QUOTA_PATH.into(), sub.path);
    primitive
        .attributes
        .insert(primitive_attrs::PROJECT_ID.into(), sub.project_id.to_string());
    primitive
}

#[async_trait]
impl NodeAgent for PrimitiveDriver {
    async fn get_primitive(&self, target: &PrimitiveRef) -> Result<Option<Primitive>> {
        match target {
            PrimitiveRef::LogicalVolume { vg, name } => self.get_logical_volume(vg, name).await,
            PrimitiveRef::VolumeGroup { name } => Ok(self.lvm.get_vg(name).await?.map(|vg| {
                let mut primitive = Primitive::new(target.clone());
                primitive.size_bytes = vg.size_bytes;
                primitive.uuid = Some(vg.uuid).filter(|u| !u.is_empty());
                primitive.tags = vg.tags;
                primitive
                    .attributes
                    .insert("freeBytes".into(), vg.free_bytes.to_string());
                primitive
            })),
            PrimitiveRef::Device { path } => {
                self.existing_path(target, path, BLOCK_DEVICE_KIND).await
            }
            PrimitiveRef::MountPoint { path } => {
                self.existing_path(target, path, DIRECTORY_KIND).await
            }
            PrimitiveRef::PmemNamespace { region, name } => Ok(self
                .pmem
                .get_namespace(region, name)
                .await?
                .map(|ns| pmem_primitive(region, name, ns))),
            PrimitiveRef::QuotaPath { root, name } => Ok(self
                .quota
                .get_subpath(root, name)
                .await?
                .map(|sub| quota_primitive(root, name, sub))),
        }
    }

    async fn create_primitive(
        &self,
        target: &PrimitiveRef,
        options: &CreateOptions,
    ) -> Result<Primitive> {
        if let Some(existing) = self.get_primitive(target).await? {
            debug!("{} already exists", target);
            return Ok(existing);
        }

        match target {
            PrimitiveRef::LogicalVolume { vg, name } => {
                if !self.lvm.vg_exists(vg).await? {
                    return Err(Error::not_found("vg", vg.as_str()));
                }
                self.lvm
                    .create_lv(vg, name, options.size_bytes, options.striped, &options.tags)
                    .await?;
                self.require_logical_volume(vg, name).await
            }
            PrimitiveRef::VolumeGroup { name } => {
                let pv = options.physical_volume.as_deref().ok_or_else(|| {
                    Error::InvalidArgument(format!("volume group {} needs a physical volume", name))
                })?;
                self.lvm.create_vg(name, pv, &options.tags).await?;
                self.get_primitive(target).await?.ok_or_else(|| {
                    Error::Internal(format!("volume group {} missing after create", name))
                })
            }
            PrimitiveRef::Device { path } | PrimitiveRef::MountPoint { path } => {
                Err(Error::not_found("pool", path.as_str()))
            }
            PrimitiveRef::PmemNamespace { region, name } => {
                let ns = self
                    .pmem
                    .create_namespace(region, name, options.size_bytes)
                    .await?;
                Ok(pmem_primitive(region, name, ns))
            }
            PrimitiveRef::QuotaPath { root, name } => {
                let sub = self.quota.create_subpath(root, name).await?;
                Ok(quota_primitive(root, name, sub))
            }
        }
    }

    async fn delete_primitive(&self, target: &PrimitiveRef) -> Result<()> {
        match target {
            PrimitiveRef::LogicalVolume { vg, name } => {
                self.lvm.remove_lv(vg, name).await?;
            }
            PrimitiveRef::VolumeGroup { name } => {
                self.lvm.remove_vg(name).await?;
            }
            PrimitiveRef::Device { path } | PrimitiveRef::MountPoint { path } => {
                debug!("Nothing to delete for pre-existing pool {}", path);
            }
            PrimitiveRef::PmemNamespace { region, name } => {
                let ns = self
                    .pmem
                    .get_namespace(region, name)
                    .await?
                    .ok_or_else(|| Error::not_found("pmem namespace", format!("{}/{}", region, name)))?;
                self.pmem.delete_namespace(&ns.dev).await?;
            }
            PrimitiveRef::QuotaPath { root, name } => {
                self.quota
                    .remove_subpath(&QuotaDriver::subpath(root, name)?)
                    .await?;
            }
        }
        info!("Deleted {}", target);
        Ok(())
    }

    async fn expand_primitive(&self, target: &PrimitiveRef, size_bytes: u64) -> Result<()> {
        match target {
            PrimitiveRef::LogicalVolume { vg, name } => {
                let current = self.lvm.lv_size(vg, name).await?;
                if current >= size_bytes {
                    debug!("{} already {} bytes, no extend needed", target, current);
                    return Ok(());
                }
                self.lvm.extend_lv(vg, name, size_bytes).await?;
                Ok(())
            }
            PrimitiveRef::QuotaPath { root, name } => {
                let limit = quota_kib(size_bytes);
                self.quota
                    .set_quota(&QuotaDriver::subpath(root, name)?, limit, limit)
                    .await
            }
            _ => Err(Error::Unimplemented(format!("expanding {}", target))),
        }
    }

    async fn list_logical_volumes(&self, vg: &str) -> Result<Vec<Primitive>> {
        Ok(self
            .lvm
            .list_lv(vg)
            .await?
            .into_iter()
            .map(|lv| lv_primitive(vg, lv))
            .collect())
    }

    async fn create_snapshot(
        &self,
        vg: &str,
        name: &str,
        source: &str,
        size_bytes: u64,
    ) -> Result<Primitive> {
        if let Some(existing) = self.get_logical_volume(vg, name).await? {
            debug!("Snapshot {}/{} already exists", vg, name);
            return Ok(existing);
        }
        self.lvm
            .create_snapshot_lv(vg, name, source, size_bytes)
            .await?;
        self.require_logical_volume(vg, name).await
    }

    async fn delete_snapshot(&self, vg: &str, name: &str) -> Result<()> {
        self.lvm.remove_lv(vg, name).await?;
        Ok(())
    }

    async fn add_tags(&self, target: &PrimitiveRef, tags: &[String]) -> Result<()> {
        match target {
            PrimitiveRef::LogicalVolume { vg, name } => self.lvm.add_lv_tags(vg, name, tags).await,
            _ => Err(Error::Unimplemented(format!("tagging {}", target))),
        }
    }

    async fn remove_tags(&self, target: &PrimitiveRef, tags: &[String]) -> Result<()> {
        match target {
            PrimitiveRef::LogicalVolume { vg, name } => {
                self.lvm.remove_lv_tags(vg, name, tags).await
            }
            _ => Err(Error::Unimplemented(format!("untagging {}", target))),
        }
    }

    async fn set_quota(&self, path: &str, soft_kib: u64, hard_kib: u64) -> Result<()> {
        self.quota.set_quota(path, soft_kib, hard_kib).await
    }

    async fn clean_path(&self, path: &str) -> Result<()> {
        if !path.starts_with('/') || path.trim_end_matches('/').is_empty() {
            return Err(Error::InvalidArgument(format!("refusing to clean {}", path)));
        }
        match self.file_kind(path).await? {
            None => return Err(Error::not_found("path", path)),
            Some(kind) if kind != DIRECTORY_KIND => {
                return Err(Error::InvalidArgument(format!(
                    "{} is a {}, expected a {}",
                    path, kind, DIRECTORY_KIND
                )))
            }
            Some(_) => {}
        }
        run_checked(
            self.runner.as_ref(),
            "find",
            &args([path, "-mindepth", "1", "-xdev", "-delete"]),
        )
        .await?;
        info!("Cleaned {}", path);
        Ok(())
    }
}
