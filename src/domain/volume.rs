//! Volume model - requests, kinds, placement and lifecycle state
//!
//! Everything the controller and node engine exchange about a volume.
//! Placement is carried in the volume context, a flat string map that is
//! handed back verbatim on every later call for the same volume.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One gibibyte
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Filesystem used when the request does not name one
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Persistent memory region used when nothing else selects one
pub const DEFAULT_PMEM_REGION: &str = "region0";

/// Flat attribute map persisted with a volume
pub type VolumeContext = BTreeMap<String, String>;

// =============================================================================
// Attribute Keys
// =============================================================================

/// Keys recognised in request parameters and the volume context
pub mod keys {
    pub const VOLUME_TYPE: &str = "volumeType";
    pub const FS_TYPE: &str = "fsType";
    pub const LVM_TYPE: &str = "lvmType";
    pub const VG_NAME: &str = "vgName";
    pub const MOUNT_POINT: &str = "MountPoint";
    pub const DEVICE: &str = "device";
    pub const PMEM_REGION: &str = "pmemRegion";
    pub const PMEM_NAMESPACE: &str = "pmemNameSpace";
    pub const PMEM_BLOCK_DEV: &str = "pmemBlockDev";
    pub const QUOTA_ROOT: &str = "rootPath";
    pub const QUOTA_FULL_PATH: &str = "projQuotaFullPath";

    pub const SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";
    pub const SELECTED_STORAGE: &str = "volume.kubernetes.io/selected-storage";
    pub const CLAIM_NAME: &str = "csi.storage.k8s.io/pvc/name";
    pub const CLAIM_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";

    pub const SNAPSHOT_ID: &str = "localvolume.csi.io/snapshot";
    pub const SNAPSHOT_READ_ONLY: &str = "localvolume.csi.io/readonly";
    pub const SNAPSHOT_INITIAL_SIZE: &str = "localvolume.csi.io/snapshot-initial-size";

    /// Platform bookkeeping keys never written into a volume context
    pub const BOOKKEEPING: [&str; 3] = [
        "kubectl.kubernetes.io/last-applied-configuration",
        "volume.beta.kubernetes.io/storage-provisioner",
        "storage.kubernetes.io/csiProvisionerIdentity",
    ];
}

/// Topology key advertised by every node
pub const TOPOLOGY_NODE_KEY: &str = "topology.localvolume.csi.io/hostname";

/// Look up a non-empty attribute
pub fn attribute<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Look up a required attribute
pub fn required_attribute<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    attribute(map, key)
        .ok_or_else(|| Error::InvalidArgument(format!("missing required attribute {}", key)))
}

// =============================================================================
// Volume Kind
// =============================================================================

/// Kind of local storage backing a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum VolumeKind {
    /// Logical volume carved from a volume group
    LogicalVolume { striped: bool, fs_type: String },
    /// Whole raw block device
    RawDevice { fs_type: String },
    /// Pre-existing directory bind-mounted into the workload
    MountPoint,
    /// Persistent memory namespace in fsdax mode
    PersistentMemory { region: Option<String> },
    /// Sub-directory limited by a filesystem project quota
    QuotaPath { root: Option<String> },
}

impl VolumeKind {
    /// Parse the kind and its parameter schema from request parameters
    pub fn from_parameters(params: &BTreeMap<String, String>) -> Result<Self> {
        let fs_type = attribute(params, keys::FS_TYPE)
            .unwrap_or(DEFAULT_FS_TYPE)
            .to_string();

        match attribute(params, keys::VOLUME_TYPE) {
            Some("LVM") => {
                let striped = match attribute(params, keys::LVM_TYPE) {
                    None | Some("linear") => false,
                    Some("striping") => true,
                    Some(other) => {
                        return Err(Error::InvalidArgument(format!(
                            "unsupported lvmType {}: use 'linear' or 'striping'",
                            other
                        )))
                    }
                };
                Ok(VolumeKind::LogicalVolume { striped, fs_type })
            }
            Some("Device") => Ok(VolumeKind::RawDevice { fs_type }),
            Some("MountPoint") => Ok(VolumeKind::MountPoint),
            Some("PMEM") => Ok(VolumeKind::PersistentMemory {
                region: attribute(params, keys::PMEM_REGION).map(String::from),
            }),
            Some("QuotaPath") => Ok(VolumeKind::QuotaPath {
                root: attribute(params, keys::QUOTA_ROOT).map(String::from),
            }),
            Some(other) => Err(Error::InvalidArgument(format!(
                "unsupported volumeType {}",
                other
            ))),
            None => Err(Error::InvalidArgument(format!(
                "parameter {} is required",
                keys::VOLUME_TYPE
            ))),
        }
    }

    /// Value of `volumeType` for this kind
    pub fn type_name(&self) -> &'static str {
        match self {
            VolumeKind::LogicalVolume { .. } => "LVM",
            VolumeKind::RawDevice { .. } => "Device",
            VolumeKind::MountPoint => "MountPoint",
            VolumeKind::PersistentMemory { .. } => "PMEM",
            VolumeKind::QuotaPath { .. } => "QuotaPath",
        }
    }

    /// Context key the resolved pool is persisted under
    pub fn pool_key(&self) -> &'static str {
        match self {
            VolumeKind::LogicalVolume { .. } => keys::VG_NAME,
            VolumeKind::RawDevice { .. } => keys::DEVICE,
            VolumeKind::MountPoint => keys::MOUNT_POINT,
            VolumeKind::PersistentMemory { .. } => keys::PMEM_REGION,
            VolumeKind::QuotaPath { .. } => keys::QUOTA_ROOT,
        }
    }

    /// Pool fixed by the storage class, if any
    pub fn class_pool<'a>(&'a self, params: &'a BTreeMap<String, String>) -> Option<&'a str> {
        match self {
            VolumeKind::LogicalVolume { .. } => attribute(params, keys::VG_NAME),
            VolumeKind::PersistentMemory { region } => region.as_deref(),
            VolumeKind::QuotaPath { root } => root.as_deref(),
            VolumeKind::RawDevice { .. } | VolumeKind::MountPoint => None,
        }
    }

    /// Capacity actually allocated for a request of `bytes`
    pub fn round_capacity(&self, bytes: u64) -> u64 {
        match self {
            VolumeKind::LogicalVolume { .. } => round_up_gib(bytes),
            _ => bytes,
        }
    }
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Check that `name` is a single path component
///
/// Volume names become directory names under a quota root, so separators
/// and the `.`/`..` entries are refused.
pub fn validate_path_component(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArgument(format!(
            "{:?} is not a valid single path component",
            name
        )));
    }
    Ok(())
}

/// Round up to a whole number of GiB
pub fn round_up_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB) * GIB
}

/// Quota limit in KiB for a capacity in bytes
pub fn quota_kib(bytes: u64) -> u64 {
    bytes.div_ceil(1024)
}

/// Parse a capacity quantity into bytes
///
/// Suffixes follow Kubernetes quantities: `Ki`, `Mi`, `Gi`, `Ti` are powers
/// of 1024 and `k`, `M`, `G`, `T` powers of 1000. `KiB`-style spellings are
/// accepted as binary.
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str {
        "" | "B" => 1,
        "k" | "K" => 1000,
        "M" => 1000 * 1000,
        "G" => 1000 * 1000 * 1000,
        "T" => 1000 * 1000 * 1000 * 1000,
        "Ki" | "KiB" => 1024,
        "Mi" | "MiB" => 1024 * 1024,
        "Gi" | "GiB" => GIB,
        "Ti" | "TiB" => GIB * 1024,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| Error::CapacityParse(format!("capacity overflows: {}", s)))
}

// =============================================================================
// Requests
// =============================================================================

/// Volume access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReadOnly,
    MultiNodeReadOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// How a volume will be consumed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    /// Filesystem requested for mount access
    #[serde(default)]
    pub fs_type: Option<String>,
    /// Extra mount flags
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Raw block access instead of a filesystem
    #[serde(default)]
    pub block: bool,
}

/// Node hints supplied alongside a create request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyRequirement {
    #[serde(default)]
    pub preferred: Vec<String>,
    #[serde(default)]
    pub requisite: Vec<String>,
}

/// Request to create a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    /// Volume name, reused as the volume id
    pub name: String,
    /// Requested capacity in bytes
    pub capacity_bytes: u64,
    /// Storage class parameters plus claim annotations
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub topology: TopologyRequirement,
    /// Snapshot to populate the volume from
    #[serde(default)]
    pub content_source: Option<String>,
}

/// What happens to the data of a released volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
}

/// Request to delete a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_context: VolumeContext,
    /// Mount point volumes are wiped only under `Delete`
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

/// Request to grow a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_context: VolumeContext,
}

/// Result of a volume expansion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandVolumeResponse {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

/// Request to snapshot a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotRequest {
    /// Snapshot name, reused as the snapshot id
    pub name: String,
    pub source_volume_id: String,
    /// Context of the source volume
    #[serde(default)]
    pub source_context: VolumeContext,
    /// Snapshot class parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Request to publish a volume at a target path on this node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePublishRequest {
    pub volume_id: String,
    pub target_path: String,
    #[serde(default)]
    pub volume_context: VolumeContext,
    pub capability: VolumeCapability,
    #[serde(default)]
    pub read_only: bool,
    /// Capacity to use when the catalog has no declared size
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
}

/// Request to unpublish a volume from a target path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUnpublishRequest {
    pub volume_id: String,
    pub target_path: String,
}

/// Request to grow a published volume on this node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExpandRequest {
    pub volume_id: String,
    pub volume_path: String,
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    #[serde(default)]
    pub volume_context: VolumeContext,
}

/// Identity of a node engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub topology: BTreeMap<String, String>,
}

// =============================================================================
// Placement
// =============================================================================

/// How the placement of a volume was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlacementStrategy {
    /// Node and pool both supplied by the request
    PreScheduled,
    /// One dimension supplied, the other asked of the scheduler
    PartiallyScheduled,
    /// Both asked of the scheduler
    Unscheduled,
}

/// Resolved node and pool for a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementDecision {
    pub node: String,
    pub pool: String,
    pub strategy: PlacementStrategy,
}

/// Query sent to the external scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleQuery {
    pub namespace: String,
    pub claim: String,
    pub volume_type: String,
    pub node: Option<String>,
    pub pool: Option<String>,
}

/// Binding returned by the external scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingInfo {
    #[serde(default)]
    pub node: String,
    #[serde(default, alias = "vgName")]
    pub pool: Option<String>,
    #[serde(default, alias = "mountPoint")]
    pub disk: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

impl BindingInfo {
    /// Pool chosen for a given kind
    pub fn pool_for(&self, kind: &VolumeKind) -> Option<String> {
        let pick = match kind {
            VolumeKind::RawDevice { .. } => self.device.as_ref().or(self.pool.as_ref()),
            VolumeKind::MountPoint => self.disk.as_ref().or(self.pool.as_ref()),
            _ => self.pool.as_ref(),
        };
        pick.filter(|p| !p.is_empty()).cloned()
    }
}

// =============================================================================
// Volume Records
// =============================================================================

/// A created volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: u64,
    pub volume_context: VolumeContext,
    /// Node the volume is reachable from
    pub accessible_node: Option<String>,
    /// Snapshot the volume was populated from
    pub content_source: Option<String>,
}

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeState {
    Requested,
    Placed,
    PrimitiveCreated,
    Published,
    Unpublished,
    Deleting,
    Deleted,
}

impl VolumeState {
    /// Whether `next` may follow this state
    pub fn can_transition_to(self, next: VolumeState) -> bool {
        use VolumeState::*;
        matches!(
            (self, next),
            (Requested, Placed)
                | (Placed, PrimitiveCreated)
                | (PrimitiveCreated, Published)
                | (Published, Unpublished)
                | (Unpublished, Published)
                | (Requested, Deleting)
                | (Placed, Deleting)
                | (PrimitiveCreated, Deleting)
                | (Unpublished, Deleting)
                | (Deleting, Deleted)
        )
    }

    /// Checked transition
    pub fn transition(self, next: VolumeState) -> Result<VolumeState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::Internal(format!(
                "invalid volume state transition {:?} -> {:?}",
                self, next
            )))
        }
    }
}

/// A created snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_bytes: u64,
    pub read_only: bool,
    pub ready_to_use: bool,
    pub creation_time: DateTime<Utc>,
}

/// Catalog view of a snapshot and its source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotBinding {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub source_context: VolumeContext,
    pub read_only: bool,
}

// =============================================================================
// Capacity Primitives
// =============================================================================

/// Address of a capacity primitive on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PrimitiveRef {
    LogicalVolume { vg: String, name: String },
    VolumeGroup { name: String },
    Device { path: String },
    MountPoint { path: String },
    PmemNamespace { region: String, name: String },
    QuotaPath { root: String, name: String },
}

impl std::fmt::Display for PrimitiveRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimitiveRef::LogicalVolume { vg, name } => write!(f, "lv {}/{}", vg, name),
            PrimitiveRef::VolumeGroup { name } => write!(f, "vg {}", name),
            PrimitiveRef::Device { path } => write!(f, "device {}", path),
            PrimitiveRef::MountPoint { path } => write!(f, "mountpoint {}", path),
            PrimitiveRef::PmemNamespace { region, name } => {
                write!(f, "pmem {}/{}", region, name)
            }
            PrimitiveRef::QuotaPath { root, name } => write!(f, "quota {}/{}", root, name),
        }
    }
}

/// Live description of a capacity primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Primitive {
    pub reference: PrimitiveRef,
    pub size_bytes: u64,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Kind-specific details (namespace device, quota path, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Primitive {
    /// Bare primitive with no size or details
    pub fn new(reference: PrimitiveRef) -> Self {
        Self {
            reference,
            size_bytes: 0,
            uuid: None,
            tags: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Attribute keys set on [`Primitive::attributes`]
pub mod primitive_attrs {
    pub const PMEM_DEV: &str = "dev";
    pub const PMEM_BLOCK_DEV: &str = "blockdev";
    pub const QUOTA_PATH: &str = "path";
    pub const PROJECT_ID: &str = "projectId";
    /// Source logical volume of a snapshot
    pub const ORIGIN: &str = "origin";
}

/// Options for creating a primitive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    pub size_bytes: u64,
    #[serde(default)]
    pub striped: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Physical volume for a new volume group
    #[serde(default)]
    pub physical_volume: Option<String>,
}

/// Tag that blocks removal of a logical volume or volume group
pub const PROTECTED_TAG: &str = "protected";
