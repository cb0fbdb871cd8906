//! Domain Ports - Core trait definitions for the volume engine
//!
//! These traits define the boundaries between the lifecycle logic and the
//! outside world: host processes, the mount table, remote node agents, the
//! external scheduler and the platform catalog. Adapters implement them.

use crate::domain::volume::{
    BindingInfo, CreateOptions, Primitive, PrimitiveRef, ScheduleQuery, SnapshotBinding, Volume,
};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Command Runner Port
// =============================================================================

/// Captured result of a host command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Port for executing host commands as argv vectors
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

// =============================================================================
// Mounter Port
// =============================================================================

/// Port for filesystem and mount-table operations on the local node
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Whether `target` is a mount point; `NotFound` when it does not exist
    async fn is_mounted(&self, target: &str) -> Result<bool>;

    /// Mount `source` at `target`
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<()>;

    /// Unmount `target`
    async fn unmount(&self, target: &str) -> Result<()>;

    /// Filesystem signature on `device`, `None` when blank
    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>>;

    /// Create a filesystem of `fs_type` on `device`
    async fn format(&self, device: &str, fs_type: &str) -> Result<()>;

    /// Grow the filesystem on `device` mounted at `mount_path` online
    async fn resize_filesystem(&self, device: &str, mount_path: &str) -> Result<()>;

    /// Create a directory and its parents
    async fn ensure_directory(&self, path: &str) -> Result<()>;

    /// Create an empty regular file and its parent directories
    async fn ensure_file(&self, path: &str) -> Result<()>;
}

// =============================================================================
// Node Agent Port
// =============================================================================

/// Port for capacity-primitive operations on one node
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Live lookup of a primitive
    async fn get_primitive(&self, target: &PrimitiveRef) -> Result<Option<Primitive>>;

    /// Create a primitive, returning the existing one if already present
    async fn create_primitive(
        &self,
        target: &PrimitiveRef,
        options: &CreateOptions,
    ) -> Result<Primitive>;

    /// Remove a primitive
    async fn delete_primitive(&self, target: &PrimitiveRef) -> Result<()>;

    /// Grow a primitive to `size_bytes`
    async fn expand_primitive(&self, target: &PrimitiveRef, size_bytes: u64) -> Result<()>;

    /// List logical volumes of a volume group
    async fn list_logical_volumes(&self, vg: &str) -> Result<Vec<Primitive>>;

    /// Create a read-only snapshot of logical volume `source` in `vg`
    async fn create_snapshot(
        &self,
        vg: &str,
        name: &str,
        source: &str,
        size_bytes: u64,
    ) -> Result<Primitive>;

    /// Remove a snapshot logical volume
    async fn delete_snapshot(&self, vg: &str, name: &str) -> Result<()>;

    async fn add_tags(&self, target: &PrimitiveRef, tags: &[String]) -> Result<()>;

    async fn remove_tags(&self, target: &PrimitiveRef, tags: &[String]) -> Result<()>;

    /// Set soft and hard project quota limits in KiB on a quota path
    async fn set_quota(&self, path: &str, soft_kib: u64, hard_kib: u64) -> Result<()>;

    /// Remove everything below the directory `path`, keeping the directory
    async fn clean_path(&self, path: &str) -> Result<()>;

    /// Release the connection behind this agent
    fn close(self: Box<Self>) {}
}

#[async_trait]
impl<T: NodeAgent + ?Sized> NodeAgent for Arc<T> {
    async fn get_primitive(&self, target: &PrimitiveRef) -> Result<Option<Primitive>> {
        (**self).get_primitive(target).await
    }

    async fn create_primitive(
        &self,
        target: &PrimitiveRef,
        options: &CreateOptions,
    ) -> Result<Primitive> {
        (**self).create_primitive(target, options).await
    }

    async fn delete_primitive(&self, target: &PrimitiveRef) -> Result<()> {
        (**self).delete_primitive(target).await
    }

    async fn expand_primitive(&self, target: &PrimitiveRef, size_bytes: u64) -> Result<()> {
        (**self).expand_primitive(target, size_bytes).await
    }

    async fn list_logical_volumes(&self, vg: &str) -> Result<Vec<Primitive>> {
        (**self).list_logical_volumes(vg).await
    }

    async fn create_snapshot(
        &self,
        vg: &str,
        name: &str,
        source: &str,
        size_bytes: u64,
    ) -> Result<Primitive> {
        (**self).create_snapshot(vg, name, source, size_bytes).await
    }

    async fn delete_snapshot(&self, vg: &str, name: &str) -> Result<()> {
        (**self).delete_snapshot(vg, name).await
    }

    async fn add_tags(&self, target: &PrimitiveRef, tags: &[String]) -> Result<()> {
        (**self).add_tags(target, tags).await
    }

    async fn remove_tags(&self, target: &PrimitiveRef, tags: &[String]) -> Result<()> {
        (**self).remove_tags(target, tags).await
    }

    async fn set_quota(&self, path: &str, soft_kib: u64, hard_kib: u64) -> Result<()> {
        (**self).set_quota(path, soft_kib, hard_kib).await
    }

    async fn clean_path(&self, path: &str) -> Result<()> {
        (**self).clean_path(path).await
    }
}

/// Port for reaching the node agent of a remote node
#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Open a connection to the agent at `address` within `timeout`
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn NodeAgent>>;
}

// =============================================================================
// Scheduler Port
// =============================================================================

/// Port for the external placement service
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Ask for a node/pool binding for one claim
    async fn schedule(&self, query: &ScheduleQuery) -> Result<BindingInfo>;
}

// =============================================================================
// Catalog Port
// =============================================================================

/// Platform objects the engine depends on
///
/// The controller records every volume and snapshot it creates and forgets
/// them once deleted, so later snapshot and delete calls can be resolved.
#[async_trait]
pub trait VolumeCatalog: Send + Sync {
    /// Address (host or host:port) of the agent on `node`
    async fn node_address(&self, node: &str) -> Result<String>;

    /// Capacity declared by the claim that owns `volume_id`
    async fn declared_capacity(&self, volume_id: &str) -> Result<Option<u64>>;

    /// Snapshot and the volume it was taken from
    async fn snapshot_binding(&self, snapshot_id: &str) -> Result<Option<SnapshotBinding>>;

    /// Volumes populated from `snapshot_id`
    async fn volumes_using_snapshot(&self, snapshot_id: &str) -> Result<Vec<String>>;

    /// Snapshots taken of `volume_id`
    async fn snapshots_of_volume(&self, volume_id: &str) -> Result<Vec<String>>;

    /// Remember a created volume, its capacity and its snapshot source
    async fn record_volume(&self, volume: &Volume) -> Result<()>;

    async fn forget_volume(&self, volume_id: &str) -> Result<()>;

    /// Remember a created snapshot and the volume it was taken from
    async fn record_snapshot(&self, binding: SnapshotBinding) -> Result<()>;

    async fn forget_snapshot(&self, snapshot_id: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases
// =============================================================================

pub type CommandRunnerRef = Arc<dyn CommandRunner>;
pub type MounterRef = Arc<dyn Mounter>;
pub type NodeAgentRef = Arc<dyn NodeAgent>;
pub type NodeConnectorRef = Arc<dyn NodeConnector>;
pub type SchedulerRef = Arc<dyn Scheduler>;
pub type VolumeCatalogRef = Arc<dyn VolumeCatalog>;
