//! Control-Plane Lifecycle Controller
//!
//! Drives create, delete, expand and snapshot transitions of local volumes.
//! Placement is resolved once at create time and afterwards read back from
//! the volume context, never re-scheduled. All primitive work happens on
//! the owning node through its agent, one connection per operation.

use super::idempotency::VolumeCache;
use crate::agent::{with_default_port, DEFAULT_AGENT_PORT};
use crate::domain::ports::{NodeAgent, NodeConnectorRef, SchedulerRef, VolumeCatalogRef};
use crate::domain::volume::{
    attribute, keys, parse_capacity, primitive_attrs, quota_kib, required_attribute,
    round_up_gib, validate_path_component, CreateOptions, CreateSnapshotRequest,
    CreateVolumeRequest, DeleteVolumeRequest, ExpandVolumeRequest, ExpandVolumeResponse,
    PlacementDecision, Primitive, PrimitiveRef, ReclaimPolicy, SnapshotBinding, SnapshotRecord,
    Volume, VolumeContext, VolumeKind, VolumeState, GIB,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::scheduling::SchedulingResolver;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the lifecycle controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Agent port appended to node addresses without one
    pub agent_port: u16,
    /// Timeout for opening a node agent connection
    pub connect_timeout: Duration,
    /// Snapshot size used when the snapshot class does not set one
    pub snapshot_initial_size: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            agent_port: DEFAULT_AGENT_PORT,
            connect_timeout: Duration::from_secs(3),
            snapshot_initial_size: 4 * GIB,
        }
    }
}

// =============================================================================
// Lifecycle Controller
// =============================================================================

/// Controller for volume and snapshot lifecycles
pub struct LifecycleController {
    config: ControllerConfig,
    resolver: SchedulingResolver,
    connector: NodeConnectorRef,
    catalog: VolumeCatalogRef,
    cache: VolumeCache,
}

impl LifecycleController {
    /// Create a new controller
    pub fn new(
        config: ControllerConfig,
        scheduler: SchedulerRef,
        connector: NodeConnectorRef,
        catalog: VolumeCatalogRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver: SchedulingResolver::new(scheduler),
            connector,
            catalog,
            cache: VolumeCache::new(),
        })
    }

    /// Open a connection to the agent of `node`
    async fn connect(&self, node: &str) -> Result<Box<dyn NodeAgent>> {
        let address = self
            .catalog
            .node_address(node)
            .await
            .map_err(|e| e.context("resolve address of", node))?;
        let address = with_default_port(&address, self.config.agent_port);
        self.connector
            .connect(&address, self.config.connect_timeout)
            .await
            .map_err(|e| e.context("connect to", node))
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create a volume, or return the one already created under this name
    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume> {
        let result = self.create_volume_inner(&request).await;
        if let Err(e) = &result {
            error!("CreateVolume {} failed: {}", request.name, e);
        }
        metrics::observe("create_volume", &result);
        result
    }

    async fn create_volume_inner(&self, request: &CreateVolumeRequest) -> Result<Volume> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("volume name is required".into()));
        }
        if request.capabilities.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "volume {} has no capabilities",
                request.name
            )));
        }
        let kind = VolumeKind::from_parameters(&request.parameters)?;
        required_attribute(&request.parameters, keys::CLAIM_NAME)?;
        required_attribute(&request.parameters, keys::CLAIM_NAMESPACE)?;
        if matches!(kind, VolumeKind::QuotaPath { .. }) {
            validate_path_component(&request.name)?;
        }

        if let Some(volume) = self.cache.get(&request.name) {
            info!("Volume {} already created, returning cached result", request.name);
            return Ok(volume);
        }

        let volume = match &request.content_source {
            Some(snapshot_id) => self.create_from_snapshot(request, &kind, snapshot_id).await?,
            None => self.create_placed_volume(request, &kind).await?,
        };

        info!(
            "Created {} volume {} ({} bytes) on node {}",
            kind,
            volume.volume_id,
            volume.capacity_bytes,
            volume.accessible_node.as_deref().unwrap_or("-")
        );
        self.catalog.record_volume(&volume).await?;
        self.cache.record(volume.clone());
        Ok(volume)
    }

    async fn create_placed_volume(
        &self,
        request: &CreateVolumeRequest,
        kind: &VolumeKind,
    ) -> Result<Volume> {
        let placement = self.resolver.resolve(request, kind).await?;
        let capacity = kind.round_capacity(request.capacity_bytes);
        let mut context = base_context(&request.parameters);

        let agent = self.connect(&placement.node).await?;
        let outcome = materialise(
            agent.as_ref(),
            &request.name,
            kind,
            &placement,
            capacity,
            &mut context,
        )
        .await;
        agent.close();
        outcome.map_err(|e| {
            e.context(
                "create volume",
                format!("{} on {}/{}", request.name, placement.node, placement.pool),
            )
        })?;

        context.insert(kind.pool_key().to_string(), placement.pool.clone());
        context.insert(keys::SELECTED_NODE.to_string(), placement.node.clone());

        Ok(Volume {
            volume_id: request.name.clone(),
            capacity_bytes: capacity,
            volume_context: context,
            accessible_node: Some(placement.node),
            content_source: None,
        })
    }

    async fn create_from_snapshot(
        &self,
        request: &CreateVolumeRequest,
        kind: &VolumeKind,
        snapshot_id: &str,
    ) -> Result<Volume> {
        if !matches!(kind, VolumeKind::LogicalVolume { .. }) {
            return Err(Error::InvalidArgument(format!(
                "{} volumes cannot be created from a snapshot",
                kind
            )));
        }

        let binding = self
            .catalog
            .snapshot_binding(snapshot_id)
            .await?
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
        if !binding.read_only {
            return Err(Error::Unimplemented(format!(
                "snapshot {} is not read-only; only read-only snapshots can source a volume",
                snapshot_id
            )));
        }

        let node = required_attribute(&binding.source_context, keys::SELECTED_NODE)?.to_string();
        let vg = required_attribute(&binding.source_context, keys::VG_NAME)?.to_string();

        let mut context = base_context(&request.parameters);
        context.insert(keys::SELECTED_NODE.to_string(), node.clone());
        context.insert(keys::VG_NAME.to_string(), vg);
        context.insert(keys::SNAPSHOT_ID.to_string(), snapshot_id.to_string());
        context.insert(keys::SNAPSHOT_READ_ONLY.to_string(), "true".to_string());

        info!(
            "Volume {} sourced from read-only snapshot {} on node {}",
            request.name, snapshot_id, node
        );
        Ok(Volume {
            volume_id: request.name.clone(),
            capacity_bytes: request.capacity_bytes,
            volume_context: context,
            accessible_node: Some(node),
            content_source: Some(snapshot_id.to_string()),
        })
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a volume; absent volumes are already deleted
    pub async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<()> {
        let result = self.delete_volume_inner(&request).await;
        if let Err(e) = &result {
            error!("DeleteVolume {} failed: {}", request.volume_id, e);
        }
        metrics::observe("delete_volume", &result);
        result
    }

    async fn delete_volume_inner(&self, request: &DeleteVolumeRequest) -> Result<()> {
        let id = request.volume_id.as_str();
        if id.is_empty() {
            return Err(Error::InvalidArgument("volume id is required".into()));
        }
        let ctx = &request.volume_context;
        let kind = VolumeKind::from_parameters(ctx)?;

        let Some(node) = attribute(ctx, keys::SELECTED_NODE) else {
            info!("Volume {} was never placed, nothing to delete", id);
            self.cache.evict(id);
            self.catalog.forget_volume(id).await?;
            return Ok(());
        };

        let removal = match &kind {
            VolumeKind::LogicalVolume { .. } => {
                if let Some(snapshot) = attribute(ctx, keys::SNAPSHOT_ID) {
                    if attribute(ctx, keys::SNAPSHOT_READ_ONLY) != Some("true") {
                        return Err(Error::Unimplemented(format!(
                            "volume {} uses writable snapshot {}",
                            id, snapshot
                        )));
                    }
                    info!(
                        "Volume {} is backed by read-only snapshot {}, no primitive to delete",
                        id, snapshot
                    );
                    Removal::Nothing
                } else {
                    Removal::Primitive(PrimitiveRef::LogicalVolume {
                        vg: required_attribute(ctx, keys::VG_NAME)?.to_string(),
                        name: id.to_string(),
                    })
                }
            }
            VolumeKind::RawDevice { .. } => {
                info!("Volume {} uses a pre-existing device, nothing to delete", id);
                Removal::Nothing
            }
            VolumeKind::MountPoint => match request.reclaim_policy {
                ReclaimPolicy::Delete => {
                    Removal::Wipe(required_attribute(ctx, keys::MOUNT_POINT)?.to_string())
                }
                ReclaimPolicy::Retain => {
                    info!("Volume {} is retained, leaving its mount point as is", id);
                    Removal::Nothing
                }
            },
            VolumeKind::PersistentMemory { .. } => Removal::Primitive(PrimitiveRef::PmemNamespace {
                region: required_attribute(ctx, keys::PMEM_REGION)?.to_string(),
                name: id.to_string(),
            }),
            VolumeKind::QuotaPath { .. } => Removal::Primitive(PrimitiveRef::QuotaPath {
                root: required_attribute(ctx, keys::QUOTA_ROOT)?.to_string(),
                name: id.to_string(),
            }),
        };

        if matches!(removal, Removal::Primitive(PrimitiveRef::LogicalVolume { .. })) {
            refuse_snapshotted(id, self.catalog.snapshots_of_volume(id).await?)?;
        }

        if let Removal::Nothing = removal {
            self.cache.advance(id, VolumeState::Deleting)?;
        } else {
            let agent = self.connect(node).await?;
            let outcome = self.remove_on_node(agent.as_ref(), id, &removal).await;
            agent.close();
            outcome.map_err(|e| e.context("delete volume", format!("{} on {}", id, node)))?;
        }

        self.cache.advance(id, VolumeState::Deleted)?;
        self.cache.evict(id);
        self.catalog.forget_volume(id).await?;
        info!("Deleted volume {}", id);
        Ok(())
    }

    /// Node-side half of a delete
    async fn remove_on_node(&self, agent: &dyn NodeAgent, id: &str, removal: &Removal) -> Result<()> {
        match removal {
            Removal::Nothing => self.cache.advance(id, VolumeState::Deleting),
            Removal::Primitive(target) => {
                if let PrimitiveRef::LogicalVolume { vg, name } = target {
                    refuse_snapshotted(id, live_snapshots_of(agent, vg, name).await?)?;
                }
                self.cache.advance(id, VolumeState::Deleting)?;
                remove_primitive(agent, target).await
            }
            Removal::Wipe(path) => {
                self.cache.advance(id, VolumeState::Deleting)?;
                match agent.clean_path(path).await {
                    Ok(()) => info!("Wiped mount point {} of volume {}", path, id),
                    Err(e) if e.is_not_found() => info!("Mount point {} already gone", path),
                    Err(e) => return Err(e),
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Expand
    // =========================================================================

    /// Grow a volume on the node recorded in its context
    pub async fn expand_volume(&self, request: ExpandVolumeRequest) -> Result<ExpandVolumeResponse> {
        let result = self.expand_volume_inner(&request).await;
        if let Err(e) = &result {
            error!("ExpandVolume {} failed: {}", request.volume_id, e);
        }
        metrics::observe("expand_volume", &result);
        result
    }

    async fn expand_volume_inner(&self, request: &ExpandVolumeRequest) -> Result<ExpandVolumeResponse> {
        let id = request.volume_id.as_str();
        if id.is_empty() {
            return Err(Error::InvalidArgument("volume id is required".into()));
        }
        if request.capacity_bytes == 0 {
            return Err(Error::InvalidArgument(format!(
                "volume {} needs a non-zero target capacity",
                id
            )));
        }
        let ctx = &request.volume_context;
        let kind = VolumeKind::from_parameters(ctx)?;

        match &kind {
            VolumeKind::LogicalVolume { .. } => {
                if attribute(ctx, keys::SNAPSHOT_ID).is_some() {
                    return Err(Error::Unimplemented(format!(
                        "volume {} is backed by a read-only snapshot",
                        id
                    )));
                }
                let node = required_attribute(ctx, keys::SELECTED_NODE)?;
                let target = PrimitiveRef::LogicalVolume {
                    vg: required_attribute(ctx, keys::VG_NAME)?.to_string(),
                    name: id.to_string(),
                };
                let capacity = round_up_gib(request.capacity_bytes);

                let agent = self.connect(node).await?;
                let outcome = grow_primitive(agent.as_ref(), &target, capacity).await;
                agent.close();
                outcome.map_err(|e| e.context("expand volume", format!("{} on {}", id, node)))?;

                info!("Expanded volume {} to {} bytes on node {}", id, capacity, node);
                Ok(ExpandVolumeResponse {
                    capacity_bytes: capacity,
                    node_expansion_required: true,
                })
            }
            VolumeKind::QuotaPath { .. } => {
                let node = required_attribute(ctx, keys::SELECTED_NODE)?;
                let path = required_attribute(ctx, keys::QUOTA_FULL_PATH)?;
                let limit = quota_kib(request.capacity_bytes);

                let agent = self.connect(node).await?;
                let outcome = agent.set_quota(path, limit, limit).await;
                agent.close();
                outcome.map_err(|e| e.context("expand volume", format!("{} on {}", id, node)))?;

                info!("Raised quota of volume {} to {} KiB on node {}", id, limit, node);
                Ok(ExpandVolumeResponse {
                    capacity_bytes: request.capacity_bytes,
                    node_expansion_required: false,
                })
            }
            VolumeKind::PersistentMemory { .. }
            | VolumeKind::RawDevice { .. }
            | VolumeKind::MountPoint => Err(Error::Unimplemented(format!(
                "{} volumes cannot be expanded",
                kind
            ))),
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Take a read-only snapshot of a logical volume
    pub async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<SnapshotRecord> {
        let result = self.create_snapshot_inner(&request).await;
        if let Err(e) = &result {
            error!("CreateSnapshot {} failed: {}", request.name, e);
        }
        metrics::observe("create_snapshot", &result);
        result
    }

    async fn create_snapshot_inner(&self, request: &CreateSnapshotRequest) -> Result<SnapshotRecord> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name is required".into()));
        }
        if request.source_volume_id.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "snapshot {} has no source volume",
                request.name
            )));
        }
        if attribute(&request.parameters, keys::SNAPSHOT_READ_ONLY) != Some("true") {
            return Err(Error::Unimplemented(format!(
                "snapshot {}: only read-only snapshots are supported, set {}=true",
                request.name,
                keys::SNAPSHOT_READ_ONLY
            )));
        }

        let source = &request.source_context;
        if !matches!(
            VolumeKind::from_parameters(source)?,
            VolumeKind::LogicalVolume { .. }
        ) {
            return Err(Error::InvalidArgument(format!(
                "volume {} is not a logical volume",
                request.source_volume_id
            )));
        }
        let node = attribute(source, keys::SELECTED_NODE).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "source volume {} is not placed on a node",
                request.source_volume_id
            ))
        })?;
        let vg = required_attribute(source, keys::VG_NAME)?;

        let initial = match attribute(&request.parameters, keys::SNAPSHOT_INITIAL_SIZE) {
            Some(size) => parse_capacity(size)?,
            None => self.config.snapshot_initial_size,
        };
        let declared = self
            .catalog
            .declared_capacity(&request.source_volume_id)
            .await?;

        let agent = self.connect(node).await?;
        let outcome: Result<Primitive> = async {
            let source_size = match declared {
                Some(size) => size,
                None => live_size(agent.as_ref(), vg, &request.source_volume_id).await?,
            };
            let size = initial.min(source_size);
            if size < initial {
                warn!(
                    "Snapshot {} initial size {} clamped to source capacity {}",
                    request.name, initial, source_size
                );
            }
            ensure_snapshot(agent.as_ref(), vg, &request.name, &request.source_volume_id, size).await
        }
        .await;
        agent.close();
        let snapshot = outcome
            .map_err(|e| e.context("create snapshot", format!("{} on {}", request.name, node)))?;

        self.catalog
            .record_snapshot(SnapshotBinding {
                snapshot_id: request.name.clone(),
                source_volume_id: request.source_volume_id.clone(),
                source_context: source.clone(),
                read_only: true,
            })
            .await?;

        info!(
            "Created snapshot {} of {} ({} bytes) on node {}",
            request.name, request.source_volume_id, snapshot.size_bytes, node
        );
        Ok(SnapshotRecord {
            snapshot_id: request.name.clone(),
            source_volume_id: request.source_volume_id.clone(),
            size_bytes: snapshot.size_bytes,
            read_only: true,
            ready_to_use: true,
            creation_time: Utc::now(),
        })
    }

    /// Delete a snapshot no volume is populated from
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let result = self.delete_snapshot_inner(snapshot_id).await;
        if let Err(e) = &result {
            error!("DeleteSnapshot {} failed: {}", snapshot_id, e);
        }
        metrics::observe("delete_snapshot", &result);
        result
    }

    async fn delete_snapshot_inner(&self, snapshot_id: &str) -> Result<()> {
        if snapshot_id.is_empty() {
            return Err(Error::InvalidArgument("snapshot id is required".into()));
        }

        let users = self.catalog.volumes_using_snapshot(snapshot_id).await?;
        if !users.is_empty() {
            return Err(Error::Aborted(format!(
                "snapshot {} is still used by {}",
                snapshot_id,
                users.join(", ")
            )));
        }

        let binding = self
            .catalog
            .snapshot_binding(snapshot_id)
            .await?
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
        let node = required_attribute(&binding.source_context, keys::SELECTED_NODE)?;
        let vg = required_attribute(&binding.source_context, keys::VG_NAME)?;
        let target = PrimitiveRef::LogicalVolume {
            vg: vg.to_string(),
            name: snapshot_id.to_string(),
        };

        let agent = self.connect(node).await?;
        let outcome = remove_snapshot(agent.as_ref(), &target, vg, snapshot_id).await;
        agent.close();
        outcome.map_err(|e| e.context("delete snapshot", format!("{} on {}", snapshot_id, node)))?;

        self.catalog.forget_snapshot(snapshot_id).await?;
        info!("Deleted snapshot {}", snapshot_id);
        Ok(())
    }
}

// =============================================================================
// Node Operations
// =============================================================================

/// What deleting a volume does on its node
enum Removal {
    Nothing,
    Primitive(PrimitiveRef),
    /// Empty a pre-existing mount point
    Wipe(String),
}

/// A volume with live snapshots cannot be deleted
fn refuse_snapshotted(id: &str, snapshots: Vec<String>) -> Result<()> {
    if snapshots.is_empty() {
        return Ok(());
    }
    Err(Error::Aborted(format!(
        "volume {} still has snapshots {}",
        id,
        snapshots.join(", ")
    )))
}

/// Snapshot LVs in `vg` whose origin is `name`
async fn live_snapshots_of(agent: &dyn NodeAgent, vg: &str, name: &str) -> Result<Vec<String>> {
    Ok(agent
        .list_logical_volumes(vg)
        .await?
        .into_iter()
        .filter(|lv| lv.attributes.get(primitive_attrs::ORIGIN).map(String::as_str) == Some(name))
        .filter_map(|lv| match lv.reference {
            PrimitiveRef::LogicalVolume { name, .. } => Some(name),
            _ => None,
        })
        .collect())
}

/// Live size of logical volume `name`
async fn live_size(agent: &dyn NodeAgent, vg: &str, name: &str) -> Result<u64> {
    let target = PrimitiveRef::LogicalVolume {
        vg: vg.to_string(),
        name: name.to_string(),
    };
    agent
        .get_primitive(&target)
        .await?
        .map(|lv| lv.size_bytes)
        .ok_or_else(|| Error::not_found("volume", name))
}

/// Request parameters minus platform bookkeeping
fn base_context(parameters: &BTreeMap<String, String>) -> VolumeContext {
    parameters
        .iter()
        .filter(|(k, _)| !keys::BOOKKEEPING.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Materialise the primitive backing a new volume
async fn materialise(
    agent: &dyn NodeAgent,
    name: &str,
    kind: &VolumeKind,
    placement: &PlacementDecision,
    capacity: u64,
    context: &mut VolumeContext,
) -> Result<()> {
    let pool = placement.pool.clone();
    match kind {
        VolumeKind::LogicalVolume { striped, .. } => {
            let target = PrimitiveRef::LogicalVolume {
                vg: pool,
                name: name.to_string(),
            };
            let options = CreateOptions {
                size_bytes: capacity,
                striped: *striped,
                ..Default::default()
            };
            ensure_primitive(agent, &target, &options).await?;
        }
        VolumeKind::MountPoint => {
            require_pool(agent, &PrimitiveRef::MountPoint { path: pool }).await?;
        }
        VolumeKind::RawDevice { .. } => {
            require_pool(agent, &PrimitiveRef::Device { path: pool }).await?;
        }
        VolumeKind::PersistentMemory { .. } => {
            let target = PrimitiveRef::PmemNamespace {
                region: pool,
                name: name.to_string(),
            };
            let options = CreateOptions {
                size_bytes: capacity,
                ..Default::default()
            };
            let namespace = ensure_primitive(agent, &target, &options).await?;
            for (attr, key) in [
                (primitive_attrs::PMEM_DEV, keys::PMEM_NAMESPACE),
                (primitive_attrs::PMEM_BLOCK_DEV, keys::PMEM_BLOCK_DEV),
            ] {
                let value = namespace.attributes.get(attr).ok_or_else(|| {
                    Error::Internal(format!("{} reported without {}", target, attr))
                })?;
                context.insert(key.to_string(), value.clone());
            }
        }
        VolumeKind::QuotaPath { .. } => {
            let target = PrimitiveRef::QuotaPath {
                root: pool,
                name: name.to_string(),
            };
            let options = CreateOptions {
                size_bytes: capacity,
                ..Default::default()
            };
            let subpath = ensure_primitive(agent, &target, &options).await?;
            let path = subpath
                .attributes
                .get(primitive_attrs::QUOTA_PATH)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("{} reported without a path", target)))?;
            let limit = quota_kib(capacity);
            agent.set_quota(&path, limit, limit).await?;
            context.insert(keys::QUOTA_FULL_PATH.to_string(), path);
        }
    }
    Ok(())
}

/// Get-before-create; a failed create that raced a winner counts as done
async fn ensure_primitive(
    agent: &dyn NodeAgent,
    target: &PrimitiveRef,
    options: &CreateOptions,
) -> Result<Primitive> {
    if let Some(existing) = agent.get_primitive(target).await? {
        info!("{} already exists, skipping create", target);
        return Ok(existing);
    }
    match agent.create_primitive(target, options).await {
        Ok(primitive) => {
            info!("Created {} ({} bytes)", target, primitive.size_bytes);
            Ok(primitive)
        }
        Err(e) => match agent.get_primitive(target).await {
            Ok(Some(existing)) => {
                warn!("Create of {} failed ({}) but it exists now", target, e);
                Ok(existing)
            }
            _ => Err(e),
        },
    }
}

/// Pre-existing pools are only validated
async fn require_pool(agent: &dyn NodeAgent, target: &PrimitiveRef) -> Result<()> {
    agent
        .get_primitive(target)
        .await?
        .map(|_| ())
        .ok_or_else(|| Error::not_found("pool", target.to_string()))
}

/// Get-before-delete; absent counts as deleted
async fn remove_primitive(agent: &dyn NodeAgent, target: &PrimitiveRef) -> Result<()> {
    if agent.get_primitive(target).await?.is_none() {
        info!("{} already absent", target);
        return Ok(());
    }
    match agent.delete_primitive(target).await {
        Err(e) if e.is_not_found() => {
            info!("{} vanished before delete", target);
            Ok(())
        }
        other => other,
    }
}

/// Grow a primitive that must exist
async fn grow_primitive(agent: &dyn NodeAgent, target: &PrimitiveRef, capacity: u64) -> Result<()> {
    let current = agent
        .get_primitive(target)
        .await?
        .ok_or_else(|| Error::not_found("primitive", target.to_string()))?;
    if current.size_bytes >= capacity {
        info!("{} already {} bytes", target, current.size_bytes);
        return Ok(());
    }
    agent.expand_primitive(target, capacity).await
}

async fn ensure_snapshot(
    agent: &dyn NodeAgent,
    vg: &str,
    name: &str,
    source: &str,
    size: u64,
) -> Result<Primitive> {
    let target = PrimitiveRef::LogicalVolume {
        vg: vg.to_string(),
        name: name.to_string(),
    };
    if let Some(existing) = agent.get_primitive(&target).await? {
        info!("Snapshot {} already exists", target);
        return Ok(existing);
    }
    agent.create_snapshot(vg, name, source, size).await
}

async fn remove_snapshot(
    agent: &dyn NodeAgent,
    target: &PrimitiveRef,
    vg: &str,
    name: &str,
) -> Result<()> {
    if agent.get_primitive(target).await?.is_none() {
        info!("Snapshot {} already absent", target);
        return Ok(());
    }
    match agent.delete_snapshot(vg, name).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{FakeConnector, FakeNodeAgent};
    use crate::catalog::MemoryCatalog;
    use crate::domain::ports::VolumeCatalog;
    use crate::domain::volume::{
        AccessMode, SnapshotBinding, TopologyRequirement, VolumeCapability, PROTECTED_TAG,
    };
    use crate::scheduling::resolver::testing::ScriptedScheduler;
    use assert_matches::assert_matches;

    const NODE_1: &str = "10.0.0.1:1736";
    const NODE_2: &str = "10.0.0.2:1736";

    struct Harness {
        controller: Arc<LifecycleController>,
        scheduler: Arc<ScriptedScheduler>,
        connector: Arc<FakeConnector>,
        catalog: Arc<MemoryCatalog>,
    }

    impl Harness {
        fn new() -> Self {
            let scheduler = ScriptedScheduler::new("node-1", "vg0");
            let connector = FakeConnector::new();
            let catalog = MemoryCatalog::new();
            catalog.register_node("node-1", "10.0.0.1");
            catalog.register_node("node-2", "10.0.0.2");
            let controller = LifecycleController::new(
                ControllerConfig::default(),
                scheduler.clone(),
                connector.clone(),
                catalog.clone(),
            );
            Self {
                controller,
                scheduler,
                connector,
                catalog,
            }
        }

        fn agent(&self, address: &str) -> Arc<FakeNodeAgent> {
            self.connector.agent(address)
        }
    }

    fn create_request(name: &str, capacity: u64, pairs: &[(&str, &str)]) -> CreateVolumeRequest {
        let mut parameters: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        parameters.insert(keys::CLAIM_NAME.into(), format!("claim-{}", name));
        parameters.insert(keys::CLAIM_NAMESPACE.into(), "apps".into());
        parameters.insert(
            "storage.kubernetes.io/csiProvisionerIdentity".into(),
            "1700000000-local".into(),
        );
        CreateVolumeRequest {
            name: name.into(),
            capacity_bytes: capacity,
            parameters,
            capabilities: vec![VolumeCapability {
                access_mode: AccessMode::SingleNodeWriter,
                fs_type: Some("ext4".into()),
                mount_flags: Vec::new(),
                block: false,
            }],
            topology: TopologyRequirement::default(),
            content_source: None,
        }
    }

    fn lv(vg: &str, name: &str) -> PrimitiveRef {
        PrimitiveRef::LogicalVolume {
            vg: vg.into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn test_create_twice_calls_agent_once() {
        let h = Harness::new();
        let request = create_request("pv-1", 2 * GIB, &[("volumeType", "LVM")]);

        let first = h.controller.create_volume(request.clone()).await.unwrap();
        let second = h.controller.create_volume(request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.agent(NODE_1).create_calls(), 1);
        assert_eq!(first.volume_context.get(keys::VG_NAME).map(String::as_str), Some("vg0"));
        assert_eq!(
            first.volume_context.get(keys::SELECTED_NODE).map(String::as_str),
            Some("node-1")
        );
        assert!(!first
            .volume_context
            .contains_key("storage.kubernetes.io/csiProvisionerIdentity"));
    }

    #[tokio::test]
    async fn test_create_rounds_up_to_gib() {
        let h = Harness::new();
        let volume = h
            .controller
            .create_volume(create_request("pv-1", 3 * GIB + 1, &[("volumeType", "LVM")]))
            .await
            .unwrap();

        assert_eq!(volume.capacity_bytes, 4 * GIB);
        assert_eq!(
            h.agent(NODE_1).last_create_options().unwrap().size_bytes,
            4 * GIB
        );
    }

    #[tokio::test]
    async fn test_existing_primitive_is_not_recreated() {
        let h = Harness::new();
        let mut existing = Primitive::new(lv("vg0", "pv-1"));
        existing.size_bytes = 2 * GIB;
        h.agent(NODE_1).insert(existing);

        h.controller
            .create_volume(create_request("pv-1", 2 * GIB, &[("volumeType", "LVM")]))
            .await
            .unwrap();
        assert_eq!(h.agent(NODE_1).create_calls(), 0);
    }

    #[tokio::test]
    async fn test_node_known_pool_scheduled() {
        let h = Harness::new();
        h.scheduler.answer("node-1", "vg5");

        let volume = h
            .controller
            .create_volume(create_request(
                "pv-1",
                GIB,
                &[("volumeType", "LVM"), (keys::SELECTED_NODE, "node-2")],
            ))
            .await
            .unwrap();

        let queries = h.scheduler.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].node.as_deref(), Some("node-2"));
        assert_eq!(queries[0].pool, None);
        assert_eq!(volume.accessible_node.as_deref(), Some("node-2"));
        assert!(h.agent(NODE_2).contains(&lv("vg5", "pv-1")));
    }

    #[tokio::test]
    async fn test_both_known_skip_scheduler() {
        let h = Harness::new();
        h.controller
            .create_volume(create_request(
                "pv-1",
                GIB,
                &[
                    ("volumeType", "LVM"),
                    (keys::SELECTED_NODE, "node-2"),
                    (keys::VG_NAME, "vg3"),
                ],
            ))
            .await
            .unwrap();

        assert!(h.scheduler.queries().is_empty());
        assert!(h.agent(NODE_2).contains(&lv("vg3", "pv-1")));
    }

    #[tokio::test]
    async fn test_placement_is_immutable() {
        let h = Harness::new();
        let volume = h
            .controller
            .create_volume(create_request("pv-1", GIB, &[("volumeType", "LVM")]))
            .await
            .unwrap();

        h.scheduler.answer("node-2", "vg9");

        let expanded = h
            .controller
            .expand_volume(ExpandVolumeRequest {
                volume_id: "pv-1".into(),
                capacity_bytes: 2 * GIB,
                volume_context: volume.volume_context.clone(),
            })
            .await
            .unwrap();
        assert_eq!(expanded.capacity_bytes, 2 * GIB);
        assert!(expanded.node_expansion_required);
        assert_eq!(
            h.agent(NODE_1).primitive(&lv("vg0", "pv-1")).unwrap().size_bytes,
            2 * GIB
        );

        h.controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: "pv-1".into(),
                volume_context: volume.volume_context,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(!h.agent(NODE_1).contains(&lv("vg0", "pv-1")));
        assert_eq!(h.scheduler.queries().len(), 1);
        assert!(h.connector.connects().iter().all(|a| a == NODE_1));
    }

    #[tokio::test]
    async fn test_delete_absent_primitive_succeeds() {
        let h = Harness::new();
        let context: VolumeContext = [
            ("volumeType", "LVM"),
            (keys::SELECTED_NODE, "node-1"),
            (keys::VG_NAME, "vg0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        h.controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: "pv-404".into(),
                volume_context: context,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(h.agent(NODE_1).delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_unplaced_volume_is_noop() {
        let h = Harness::new();
        let context: VolumeContext = [("volumeType".to_string(), "LVM".to_string())].into();

        h.controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: "pv-1".into(),
                volume_context: context,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(h.connector.connects().is_empty());
    }

    #[tokio::test]
    async fn test_delete_protected_is_conflict() {
        let h = Harness::new();
        let volume = h
            .controller
            .create_volume(create_request("pv-1", GIB, &[("volumeType", "LVM")]))
            .await
            .unwrap();
        h.agent(NODE_1)
            .add_tags(&lv("vg0", "pv-1"), &[PROTECTED_TAG.to_string()])
            .await
            .unwrap();

        let err = h
            .controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: "pv-1".into(),
                volume_context: volume.volume_context,
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), crate::error::ErrorCode::Conflict);
        let listed = h.agent(NODE_1).list_logical_volumes("vg0").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_recreate_after_delete() {
        let h = Harness::new();
        let request = create_request("pv-1", GIB, &[("volumeType", "LVM")]);
        let volume = h.controller.create_volume(request.clone()).await.unwrap();
        h.controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: "pv-1".into(),
                volume_context: volume.volume_context,
                ..Default::default()
            })
            .await
            .unwrap();

        h.controller.create_volume(request).await.unwrap();
        assert_eq!(h.agent(NODE_1).create_calls(), 2);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = Harness::new();

        let mut request = create_request("pv-1", GIB, &[("volumeType", "LVM")]);
        request.capabilities.clear();
        assert_matches!(
            h.controller.create_volume(request).await,
            Err(Error::InvalidArgument(_))
        );

        let request = create_request("", GIB, &[("volumeType", "LVM")]);
        assert_matches!(
            h.controller.create_volume(request).await,
            Err(Error::InvalidArgument(_))
        );

        let request = create_request("pv-1", GIB, &[("volumeType", "NFS")]);
        assert_matches!(
            h.controller.create_volume(request).await,
            Err(Error::InvalidArgument(_))
        );

        let mut request = create_request("pv-1", GIB, &[("volumeType", "LVM")]);
        request.parameters.remove(keys::CLAIM_NAMESPACE);
        assert_matches!(
            h.controller.create_volume(request).await,
            Err(Error::InvalidArgument(_))
        );
        assert!(h.connector.connects().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_unavailable() {
        let h = Harness::new();
        h.connector.set_unreachable(NODE_1);

        let err = h
            .controller
            .create_volume(create_request("pv-1", GIB, &[("volumeType", "LVM")]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("node-1"));
    }

    #[tokio::test]
    async fn test_mount_point_pool_is_validated() {
        let h = Harness::new();
        h.scheduler.answer("node-1", "/mnt/disk1");

        let err = h
            .controller
            .create_volume(create_request("pv-1", GIB, &[("volumeType", "MountPoint")]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        h.agent(NODE_1).insert(Primitive::new(PrimitiveRef::MountPoint {
            path: "/mnt/disk1".into(),
        }));
        let volume = h
            .controller
            .create_volume(create_request("pv-1", GIB, &[("volumeType", "MountPoint")]))
            .await
            .unwrap();
        assert_eq!(
            volume.volume_context.get(keys::MOUNT_POINT).map(String::as_str),
            Some("/mnt/disk1")
        );
        assert_eq!(h.agent(NODE_1).create_calls(), 0);

        assert_matches!(
            h.controller
                .expand_volume(ExpandVolumeRequest {
                    volume_id: "pv-1".into(),
                    capacity_bytes: 2 * GIB,
                    volume_context: volume.volume_context,
                })
                .await,
            Err(Error::Unimplemented(_))
        );
    }

    #[tokio::test]
    async fn test_pmem_records_namespace() {
        let h = Harness::new();
        let volume = h
            .controller
            .create_volume(create_request(
                "pv-1",
                GIB,
                &[("volumeType", "PMEM"), (keys::SELECTED_NODE, "node-1")],
            ))
            .await
            .unwrap();

        let ctx = &volume.volume_context;
        assert_eq!(ctx.get(keys::PMEM_REGION).map(String::as_str), Some("region0"));
        assert_eq!(ctx.get(keys::PMEM_NAMESPACE).map(String::as_str), Some("namespace0.0"));
        assert_eq!(ctx.get(keys::PMEM_BLOCK_DEV).map(String::as_str), Some("pmem0"));
    }

    #[tokio::test]
    async fn test_quota_path_limits() {
        let h = Harness::new();
        h.scheduler.answer("node-1", "/mnt/quota");

        let volume = h
            .controller
            .create_volume(create_request("pv-1", 10 * 1024 * 1024, &[("volumeType", "QuotaPath")]))
            .await
            .unwrap();
        assert_eq!(
            volume.volume_context.get(keys::QUOTA_FULL_PATH).map(String::as_str),
            Some("/mnt/quota/pv-1")
        );
        assert_eq!(
            h.agent(NODE_1).quota_calls(),
            vec![("/mnt/quota/pv-1".to_string(), 10240, 10240)]
        );

        let expanded = h
            .controller
            .expand_volume(ExpandVolumeRequest {
                volume_id: "pv-1".into(),
                capacity_bytes: 20 * 1024 * 1024,
                volume_context: volume.volume_context,
            })
            .await
            .unwrap();
        assert!(!expanded.node_expansion_required);
        assert_eq!(h.agent(NODE_1).quota_calls()[1].2, 20480);
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    async fn placed_source(h: &Harness) -> Volume {
        h.controller
            .create_volume(create_request("pv-src", 5 * GIB, &[("volumeType", "LVM")]))
            .await
            .unwrap()
    }

    fn snapshot_request(source: &Volume, params: &[(&str, &str)]) -> CreateSnapshotRequest {
        CreateSnapshotRequest {
            name: "snap-1".into(),
            source_volume_id: source.volume_id.clone(),
            source_context: source.volume_context.clone(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_requires_read_only() {
        let h = Harness::new();
        let source = placed_source(&h).await;
        let connects = h.connector.connects().len();

        let err = h
            .controller
            .create_snapshot(snapshot_request(&source, &[]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Unimplemented(_));
        assert_eq!(h.agent(NODE_1).snapshot_calls(), 0);
        assert_eq!(h.connector.connects().len(), connects);
    }

    #[tokio::test]
    async fn test_snapshot_size_clamped_to_source() {
        let h = Harness::new();
        let source = placed_source(&h).await;

        let snapshot = h
            .controller
            .create_snapshot(snapshot_request(
                &source,
                &[
                    (keys::SNAPSHOT_READ_ONLY, "true"),
                    (keys::SNAPSHOT_INITIAL_SIZE, "10Gi"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(snapshot.size_bytes, 5 * GIB);
        assert!(snapshot.read_only);
        assert!(snapshot.ready_to_use);
        assert_eq!(
            h.agent(NODE_1).primitive(&lv("vg0", "snap-1")).unwrap().size_bytes,
            5 * GIB
        );

        h.controller
            .create_snapshot(snapshot_request(
                &source,
                &[(keys::SNAPSHOT_READ_ONLY, "true")],
            ))
            .await
            .unwrap();
        assert_eq!(h.agent(NODE_1).snapshot_calls(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_default_initial_size() {
        let h = Harness::new();
        let source = placed_source(&h).await;

        let snapshot = h
            .controller
            .create_snapshot(snapshot_request(&source, &[(keys::SNAPSHOT_READ_ONLY, "true")]))
            .await
            .unwrap();
        assert_eq!(snapshot.size_bytes, 4 * GIB);
    }

    fn read_only_snapshot(source: &Volume) -> CreateSnapshotRequest {
        snapshot_request(source, &[(keys::SNAPSHOT_READ_ONLY, "true")])
    }

    fn delete_request(volume: &Volume) -> DeleteVolumeRequest {
        DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            volume_context: volume.volume_context.clone(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_snapshot_backed_volume_lifecycle() {
        let h = Harness::new();
        let source = placed_source(&h).await;
        h.controller
            .create_snapshot(read_only_snapshot(&source))
            .await
            .unwrap();

        let mut request = create_request("pv-clone", GIB, &[("volumeType", "LVM")]);
        request.content_source = Some("snap-1".into());
        let clone = h.controller.create_volume(request).await.unwrap();

        let ctx = &clone.volume_context;
        assert_eq!(ctx.get(keys::SNAPSHOT_ID).map(String::as_str), Some("snap-1"));
        assert_eq!(ctx.get(keys::SNAPSHOT_READ_ONLY).map(String::as_str), Some("true"));
        assert_eq!(ctx.get(keys::SELECTED_NODE).map(String::as_str), Some("node-1"));

        assert_matches!(
            h.controller.delete_snapshot("snap-1").await,
            Err(Error::Aborted(_))
        );
        assert!(h.agent(NODE_1).contains(&lv("vg0", "snap-1")));

        let deletes = h.agent(NODE_1).delete_calls();
        h.controller.delete_volume(delete_request(&clone)).await.unwrap();
        assert_eq!(h.agent(NODE_1).delete_calls(), deletes);

        h.controller.delete_snapshot("snap-1").await.unwrap();
        assert!(!h.agent(NODE_1).contains(&lv("vg0", "snap-1")));
        assert!(h.catalog.snapshot_binding("snap-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_snapshot_is_not_found() {
        let h = Harness::new();
        let mut stray = Primitive::new(lv("vg0", "snap-1"));
        stray.size_bytes = GIB;
        h.agent(NODE_1).insert(stray);

        let err = h.controller.delete_snapshot("snap-1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(h.agent(NODE_1).contains(&lv("vg0", "snap-1")));
        assert!(h.connector.connects().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_source_without_recorded_capacity() {
        let h = Harness::new();
        let mut existing = Primitive::new(lv("vg0", "pv-src"));
        existing.size_bytes = 2 * GIB;
        h.agent(NODE_1).insert(existing);
        let source = Volume {
            volume_id: "pv-src".into(),
            capacity_bytes: 2 * GIB,
            volume_context: [
                ("volumeType", "LVM"),
                (keys::SELECTED_NODE, "node-1"),
                (keys::VG_NAME, "vg0"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            accessible_node: Some("node-1".into()),
            content_source: None,
        };

        let snapshot = h
            .controller
            .create_snapshot(read_only_snapshot(&source))
            .await
            .unwrap();
        assert_eq!(snapshot.size_bytes, 2 * GIB);
        assert!(h.catalog.snapshot_binding("snap-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_source_with_snapshot_cannot_be_deleted() {
        let h = Harness::new();
        let source = placed_source(&h).await;
        h.controller
            .create_snapshot(read_only_snapshot(&source))
            .await
            .unwrap();

        let err = h
            .controller
            .delete_volume(delete_request(&source))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Aborted);
        assert!(h.agent(NODE_1).contains(&lv("vg0", "pv-src")));

        h.controller.delete_snapshot("snap-1").await.unwrap();
        h.controller.delete_volume(delete_request(&source)).await.unwrap();
        assert!(!h.agent(NODE_1).contains(&lv("vg0", "pv-src")));
    }

    #[tokio::test]
    async fn test_source_with_unrecorded_snapshot_lv_cannot_be_deleted() {
        let h = Harness::new();
        let source = placed_source(&h).await;
        let mut snapshot = Primitive::new(lv("vg0", "snap-9"));
        snapshot.size_bytes = GIB;
        snapshot
            .attributes
            .insert(primitive_attrs::ORIGIN.into(), "pv-src".into());
        h.agent(NODE_1).insert(snapshot);

        let err = h
            .controller
            .delete_volume(delete_request(&source))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Aborted);
        assert!(h.agent(NODE_1).contains(&lv("vg0", "pv-src")));
        assert_eq!(h.agent(NODE_1).delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_mount_point_wiped_on_delete() {
        let h = Harness::new();
        h.scheduler.answer("node-1", "/mnt/disk1");
        h.agent(NODE_1).insert(Primitive::new(PrimitiveRef::MountPoint {
            path: "/mnt/disk1".into(),
        }));
        let volume = h
            .controller
            .create_volume(create_request("pv-1", GIB, &[("volumeType", "MountPoint")]))
            .await
            .unwrap();

        let mut retained = delete_request(&volume);
        retained.reclaim_policy = ReclaimPolicy::Retain;
        h.controller.delete_volume(retained).await.unwrap();
        assert!(h.agent(NODE_1).cleaned_paths().is_empty());

        h.controller.delete_volume(delete_request(&volume)).await.unwrap();
        assert_eq!(h.agent(NODE_1).cleaned_paths(), vec!["/mnt/disk1".to_string()]);
    }

    #[tokio::test]
    async fn test_quota_name_cannot_escape_root() {
        let h = Harness::new();
        h.scheduler.answer("node-1", "/mnt/quota");

        for name in ["../../etc", "a/b"] {
            assert_matches!(
                h.controller
                    .create_volume(create_request(name, GIB, &[("volumeType", "QuotaPath")]))
                    .await,
                Err(Error::InvalidArgument(_))
            );
        }
        assert!(h.connector.connects().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_node_address_gets_agent_port() {
        let h = Harness::new();
        h.catalog.register_node("node-6", "fd00::6");

        h.controller
            .create_volume(create_request(
                "pv-1",
                GIB,
                &[
                    ("volumeType", "LVM"),
                    (keys::SELECTED_NODE, "node-6"),
                    (keys::VG_NAME, "vg0"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(h.connector.connects(), vec!["[fd00::6]:1736".to_string()]);
    }

    #[tokio::test]
    async fn test_writable_snapshot_source_unimplemented() {
        let h = Harness::new();
        let source = placed_source(&h).await;
        h.catalog.register_snapshot(SnapshotBinding {
            snapshot_id: "snap-rw".into(),
            source_volume_id: "pv-src".into(),
            source_context: source.volume_context,
            read_only: false,
        });

        let mut request = create_request("pv-clone", GIB, &[("volumeType", "LVM")]);
        request.content_source = Some("snap-rw".into());
        assert_matches!(
            h.controller.create_volume(request).await,
            Err(Error::Unimplemented(_))
        );
    }

    #[tokio::test]
    async fn test_expand_missing_volume_is_not_found() {
        let h = Harness::new();
        let context: VolumeContext = [
            ("volumeType", "LVM"),
            (keys::SELECTED_NODE, "node-1"),
            (keys::VG_NAME, "vg0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let err = h
            .controller
            .expand_volume(ExpandVolumeRequest {
                volume_id: "pv-404".into(),
                capacity_bytes: GIB,
                volume_context: context,
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
