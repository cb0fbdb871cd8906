//! Node-Side Mount/Resize Engine
//!
//! Makes a placed volume usable at a target path on this node: lazily
//! creates logical volumes, formats blank devices, mounts or bind-mounts,
//! and grows filesystems online after the controller grew the primitive.

use crate::domain::ports::{MounterRef, NodeAgentRef, VolumeCatalogRef};
use crate::domain::volume::{
    attribute, keys, required_attribute, round_up_gib, CreateOptions, NodeExpandRequest,
    NodeInfo, NodePublishRequest, NodeUnpublishRequest, PrimitiveRef, VolumeKind, VolumeState,
    DEFAULT_FS_TYPE, TOPOLOGY_NODE_KEY,
};
use crate::error::{Error, Result};
use crate::metrics;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for the node engine
#[derive(Debug, Clone)]
pub struct NodeEngineConfig {
    /// Name of this node as known to the platform
    pub node_id: String,
    /// Filesystem used when neither capability nor class names one
    pub default_fs: String,
}

impl Default for NodeEngineConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            default_fs: DEFAULT_FS_TYPE.to_string(),
        }
    }
}

// =============================================================================
// Node Engine
// =============================================================================

/// Per-node publish, unpublish and expand
pub struct NodeEngine {
    config: NodeEngineConfig,
    agent: NodeAgentRef,
    mounter: MounterRef,
    catalog: VolumeCatalogRef,
    /// Publish state of volumes this node has mounted
    states: DashMap<String, VolumeState>,
}

/// Block device backing a logical volume
fn lv_device(vg: &str, name: &str) -> String {
    format!("/dev/{}/{}", vg, name)
}

impl NodeEngine {
    pub fn new(
        config: NodeEngineConfig,
        agent: NodeAgentRef,
        mounter: MounterRef,
        catalog: VolumeCatalogRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            agent,
            mounter,
            catalog,
            states: DashMap::new(),
        })
    }

    /// Publish state of a volume this node has seen
    pub fn volume_state(&self, volume_id: &str) -> Option<VolumeState> {
        self.states.get(volume_id).map(|entry| *entry)
    }

    fn advance(&self, volume_id: &str, next: VolumeState) -> Result<()> {
        let mut entry = self
            .states
            .entry(volume_id.to_string())
            .or_insert(VolumeState::PrimitiveCreated);
        if *entry != next {
            *entry = entry.transition(next)?;
        }
        Ok(())
    }

    /// Identity and topology segment of this node
    pub fn node_info(&self) -> NodeInfo {
        let mut topology = BTreeMap::new();
        topology.insert(TOPOLOGY_NODE_KEY.to_string(), self.config.node_id.clone());
        NodeInfo {
            node_id: self.config.node_id.clone(),
            topology,
        }
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Mount a volume at its target path
    pub async fn publish_volume(&self, request: NodePublishRequest) -> Result<()> {
        let result = self.publish_inner(&request).await;
        if let Err(e) = &result {
            error!(
                "Publish of {} at {} failed: {}",
                request.volume_id, request.target_path, e
            );
        }
        metrics::observe("node_publish", &result);
        result
    }

    async fn publish_inner(&self, request: &NodePublishRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is required".into()));
        }
        let target = request.target_path.as_str();
        if target.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "volume {} has no target path",
                request.volume_id
            )));
        }

        let ctx = &request.volume_context;
        let kind = VolumeKind::from_parameters(ctx)?;
        let block = request.capability.block;
        if block && matches!(kind, VolumeKind::MountPoint | VolumeKind::QuotaPath { .. }) {
            return Err(Error::InvalidArgument(format!(
                "{} volume {} cannot be published as a raw block device",
                kind, request.volume_id
            )));
        }

        match self.mounter.is_mounted(target).await {
            Ok(true) => {
                info!("Volume {} already mounted at {}", request.volume_id, target);
                return self.advance(&request.volume_id, VolumeState::Published);
            }
            Ok(false) => {}
            Err(e) if e.is_not_found() && block => self.mounter.ensure_file(target).await?,
            Err(e) if e.is_not_found() => self.mounter.ensure_directory(target).await?,
            Err(e) => return Err(e),
        }

        if block {
            self.publish_block(request, &kind).await?;
            self.advance(&request.volume_id, VolumeState::Published)?;
            info!(
                "Published {} volume {} as a block device at {}",
                kind, request.volume_id, target
            );
            return Ok(());
        }

        let mut options = vec![if request.read_only { "ro" } else { "rw" }.to_string()];
        options.extend(request.capability.mount_flags.iter().cloned());

        match &kind {
            VolumeKind::LogicalVolume { fs_type, .. } => {
                let vg = required_attribute(ctx, keys::VG_NAME)?;
                match attribute(ctx, keys::SNAPSHOT_ID) {
                    Some(snapshot) => self.publish_snapshot(request, vg, snapshot).await,
                    None => {
                        let fs = self.filesystem(request, fs_type);
                        self.publish_logical_volume(request, vg, &fs, &options).await
                    }
                }
            }
            VolumeKind::MountPoint => {
                let source = required_attribute(ctx, keys::MOUNT_POINT)?;
                self.bind(source, target, request.read_only).await
            }
            VolumeKind::QuotaPath { .. } => {
                let source = required_attribute(ctx, keys::QUOTA_FULL_PATH)?;
                self.bind(source, target, request.read_only).await
            }
            VolumeKind::RawDevice { fs_type } => {
                let device = required_attribute(ctx, keys::DEVICE)?;
                let fs = self.filesystem(request, fs_type);
                let mut options = options;
                options.push("shared".to_string());
                self.format_and_mount(device, target, &fs, &options).await
            }
            VolumeKind::PersistentMemory { .. } => {
                let blockdev = required_attribute(ctx, keys::PMEM_BLOCK_DEV)?;
                let device = format!("/dev/{}", blockdev);
                let fs = self.filesystem(request, DEFAULT_FS_TYPE);
                self.format_and_mount(&device, target, &fs, &options).await
            }
        }?;

        self.advance(&request.volume_id, VolumeState::Published)?;
        info!(
            "Published {} volume {} at {}",
            kind, request.volume_id, target
        );
        Ok(())
    }

    /// Bind the backing device node onto the target file, leaving it unformatted
    async fn publish_block(&self, request: &NodePublishRequest, kind: &VolumeKind) -> Result<()> {
        let ctx = &request.volume_context;
        let device = match kind {
            VolumeKind::LogicalVolume { .. } => {
                let vg = required_attribute(ctx, keys::VG_NAME)?;
                match attribute(ctx, keys::SNAPSHOT_ID) {
                    Some(snapshot) => {
                        self.require_snapshot(vg, snapshot).await?;
                        return self
                            .bind(&lv_device(vg, snapshot), &request.target_path, true)
                            .await;
                    }
                    None => {
                        self.ensure_logical_volume(request, vg).await?;
                        lv_device(vg, &request.volume_id)
                    }
                }
            }
            VolumeKind::RawDevice { .. } => required_attribute(ctx, keys::DEVICE)?.to_string(),
            VolumeKind::PersistentMemory { .. } => {
                format!("/dev/{}", required_attribute(ctx, keys::PMEM_BLOCK_DEV)?)
            }
            VolumeKind::MountPoint | VolumeKind::QuotaPath { .. } => {
                return Err(Error::InvalidArgument(format!(
                    "{} volumes have no block device",
                    kind
                )))
            }
        };
        self.bind(&device, &request.target_path, request.read_only).await
    }

    /// Capability filesystem, then class filesystem, then the configured default
    fn filesystem(&self, request: &NodePublishRequest, class_fs: &str) -> String {
        request
            .capability
            .fs_type
            .as_deref()
            .filter(|fs| !fs.is_empty())
            .or(Some(class_fs).filter(|fs| !fs.is_empty()))
            .unwrap_or(self.config.default_fs.as_str())
            .to_string()
    }

    async fn publish_logical_volume(
        &self,
        request: &NodePublishRequest,
        vg: &str,
        fs: &str,
        options: &[String],
    ) -> Result<()> {
        let grew = self.ensure_logical_volume(request, vg).await?;
        let device = lv_device(vg, &request.volume_id);
        self.format_and_mount(&device, &request.target_path, fs, options)
            .await?;
        if grew {
            self.mounter
                .resize_filesystem(&device, &request.target_path)
                .await?;
        }
        Ok(())
    }

    /// Lazily create the logical volume, or grow it to its declared size.
    /// Returns whether an existing volume grew.
    async fn ensure_logical_volume(&self, request: &NodePublishRequest, vg: &str) -> Result<bool> {
        let id = request.volume_id.as_str();
        let reference = PrimitiveRef::LogicalVolume {
            vg: vg.to_string(),
            name: id.to_string(),
        };
        let declared = self.catalog.declared_capacity(id).await?;

        let Some(live) = self.agent.get_primitive(&reference).await? else {
            let size = declared
                .or(request.capacity_bytes)
                .filter(|size| *size > 0)
                .ok_or_else(|| Error::not_found("declared capacity of volume", id))?;
            let options = CreateOptions {
                size_bytes: round_up_gib(size),
                ..Default::default()
            };
            info!("Lazily creating {} ({} bytes)", reference, options.size_bytes);
            self.agent.create_primitive(&reference, &options).await?;
            return Ok(false);
        };

        let Some(declared) = declared else {
            return Ok(false);
        };
        let wanted = round_up_gib(declared);
        if live.size_bytes >= wanted {
            return Ok(false);
        }
        info!(
            "{} is {} bytes, growing to declared {}",
            reference, live.size_bytes, wanted
        );
        self.agent.expand_primitive(&reference, wanted).await?;
        Ok(true)
    }

    async fn require_snapshot(&self, vg: &str, snapshot: &str) -> Result<()> {
        let reference = PrimitiveRef::LogicalVolume {
            vg: vg.to_string(),
            name: snapshot.to_string(),
        };
        if self.agent.get_primitive(&reference).await?.is_none() {
            return Err(Error::not_found("snapshot", snapshot));
        }
        Ok(())
    }

    async fn publish_snapshot(
        &self,
        request: &NodePublishRequest,
        vg: &str,
        snapshot: &str,
    ) -> Result<()> {
        self.require_snapshot(vg, snapshot).await?;

        let mut options = vec!["ro".to_string()];
        options.extend(request.capability.mount_flags.iter().cloned());
        self.mounter
            .mount(&lv_device(vg, snapshot), &request.target_path, None, &options)
            .await?;
        info!(
            "Published volume {} read-only from snapshot {}",
            request.volume_id, snapshot
        );
        Ok(())
    }

    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs: &str,
        options: &[String],
    ) -> Result<()> {
        match self.mounter.probe_filesystem(device).await? {
            Some(existing) if existing != fs => {
                warn!(
                    "{} already carries {}, mounting it instead of {}",
                    device, existing, fs
                );
                self.mounter
                    .mount(device, target, Some(existing.as_str()), options)
                    .await
            }
            Some(_) => self.mounter.mount(device, target, Some(fs), options).await,
            None => {
                self.mounter.format(device, fs).await?;
                self.mounter.mount(device, target, Some(fs), options).await
            }
        }
    }

    async fn bind(&self, source: &str, target: &str, read_only: bool) -> Result<()> {
        let mut options = vec!["bind".to_string()];
        if read_only {
            options.push("ro".to_string());
        }
        self.mounter.mount(source, target, None, &options).await
    }

    // =========================================================================
    // Unpublish
    // =========================================================================

    /// Unmount a volume from its target path
    pub async fn unpublish_volume(&self, request: NodeUnpublishRequest) -> Result<()> {
        let result = self.unpublish_inner(&request).await;
        if let Err(e) = &result {
            error!(
                "Unpublish of {} from {} failed: {}",
                request.volume_id, request.target_path, e
            );
        }
        metrics::observe("node_unpublish", &result);
        result
    }

    async fn unpublish_inner(&self, request: &NodeUnpublishRequest) -> Result<()> {
        let target = request.target_path.as_str();
        if target.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "volume {} has no target path",
                request.volume_id
            )));
        }
        if !self.mounter.is_mounted(target).await? {
            info!("{} is not mounted, nothing to unpublish", target);
            return Ok(());
        }
        self.mounter.unmount(target).await?;
        if self.volume_state(&request.volume_id) == Some(VolumeState::Published) {
            self.advance(&request.volume_id, VolumeState::Unpublished)?;
        }
        info!("Unpublished volume {} from {}", request.volume_id, target);
        Ok(())
    }

    // =========================================================================
    // Expand
    // =========================================================================

    /// Grow the logical volume to its declared size and resize its filesystem
    pub async fn expand_volume(&self, request: NodeExpandRequest) -> Result<u64> {
        let result = self.expand_inner(&request).await;
        if let Err(e) = &result {
            error!("Node expand of {} failed: {}", request.volume_id, e);
        }
        metrics::observe("node_expand", &result);
        result
    }

    async fn expand_inner(&self, request: &NodeExpandRequest) -> Result<u64> {
        let id = request.volume_id.as_str();
        if id.is_empty() || request.volume_path.is_empty() {
            return Err(Error::InvalidArgument(
                "volume id and volume path are required".into(),
            ));
        }
        let ctx = &request.volume_context;
        let kind = VolumeKind::from_parameters(ctx)?;

        match &kind {
            VolumeKind::LogicalVolume { .. } => {}
            VolumeKind::MountPoint | VolumeKind::QuotaPath { .. } => {
                return Err(Error::InvalidArgument(format!(
                    "{} volume {} is a bind mount and cannot be expanded on the node",
                    kind, id
                )))
            }
            VolumeKind::RawDevice { .. } | VolumeKind::PersistentMemory { .. } => {
                return Err(Error::Unimplemented(format!(
                    "{} volumes cannot be expanded",
                    kind
                )))
            }
        }
        if attribute(ctx, keys::SNAPSHOT_ID).is_some() {
            return Err(Error::Unimplemented(format!(
                "volume {} is backed by a read-only snapshot",
                id
            )));
        }

        let vg = required_attribute(ctx, keys::VG_NAME)?;
        let reference = PrimitiveRef::LogicalVolume {
            vg: vg.to_string(),
            name: id.to_string(),
        };
        let declared = self
            .catalog
            .declared_capacity(id)
            .await?
            .or(request.capacity_bytes)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("volume {} has no target capacity", id))
            })?;
        let wanted = round_up_gib(declared);

        let live = self
            .agent
            .get_primitive(&reference)
            .await?
            .ok_or_else(|| Error::not_found("logical volume", reference.to_string()))?;
        if live.size_bytes < wanted {
            self.agent.expand_primitive(&reference, wanted).await?;
            info!("Grew {} from {} to {} bytes", reference, live.size_bytes, wanted);
        }

        let device = lv_device(vg, id);
        if let Err(e) = self
            .mounter
            .resize_filesystem(&device, &request.volume_path)
            .await
        {
            error!(
                "{} grew but resizing its filesystem at {} failed: {}",
                reference, request.volume_path, e
            );
            return Err(Error::Internal(format!(
                "filesystem resize of {} failed after the volume grew: {}",
                device, e
            )));
        }

        info!("Expanded volume {} to {} bytes", id, wanted.max(live.size_bytes));
        Ok(wanted.max(live.size_bytes))
    }
}
