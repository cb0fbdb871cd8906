//! In-memory volume catalog
//!
//! Standalone implementation of [`VolumeCatalog`]. Node addresses come from
//! configuration; volumes and snapshots are recorded by the controller as
//! it creates them.

use crate::domain::ports::VolumeCatalog;
use crate::domain::volume::{SnapshotBinding, Volume};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Catalog held in process memory
#[derive(Default)]
pub struct MemoryCatalog {
    nodes: RwLock<BTreeMap<String, String>>,
    capacities: RwLock<BTreeMap<String, u64>>,
    snapshots: RwLock<BTreeMap<String, SnapshotBinding>>,
    /// volume id -> snapshot it was populated from
    snapshot_consumers: RwLock<BTreeMap<String, String>>,
}

impl MemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the agent address of `node`
    pub fn register_node(&self, node: impl Into<String>, address: impl Into<String>) {
        self.nodes.write().insert(node.into(), address.into());
    }

    /// Parse `node=address` entries
    pub fn register_nodes<'a>(&self, entries: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for entry in entries {
            let (node, address) = entry.split_once('=').ok_or_else(|| {
                Error::Configuration(format!("node address {} is not node=address", entry))
            })?;
            if node.is_empty() || address.is_empty() {
                return Err(Error::Configuration(format!(
                    "node address {} has an empty side",
                    entry
                )));
            }
            self.register_node(node.trim(), address.trim());
        }
        Ok(())
    }

    /// Record the declared capacity of a volume's claim
    pub fn register_capacity(&self, volume_id: impl Into<String>, capacity_bytes: u64) {
        self.capacities
            .write()
            .insert(volume_id.into(), capacity_bytes);
    }

    pub fn register_snapshot(&self, binding: SnapshotBinding) {
        self.snapshots
            .write()
            .insert(binding.snapshot_id.clone(), binding);
    }

    /// Record that `volume_id` was populated from `snapshot_id`
    pub fn register_snapshot_consumer(
        &self,
        volume_id: impl Into<String>,
        snapshot_id: impl Into<String>,
    ) {
        self.snapshot_consumers
            .write()
            .insert(volume_id.into(), snapshot_id.into());
    }
}

#[async_trait]
impl VolumeCatalog for MemoryCatalog {
    async fn node_address(&self, node: &str) -> Result<String> {
        self.nodes
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| Error::not_found("node", node))
    }

    async fn declared_capacity(&self, volume_id: &str) -> Result<Option<u64>> {
        Ok(self.capacities.read().get(volume_id).copied())
    }

    async fn snapshot_binding(&self, snapshot_id: &str) -> Result<Option<SnapshotBinding>> {
        Ok(self.snapshots.read().get(snapshot_id).cloned())
    }

    async fn volumes_using_snapshot(&self, snapshot_id: &str) -> Result<Vec<String>> {
        Ok(self
            .snapshot_consumers
            .read()
            .iter()
            .filter(|(_, snap)| snap.as_str() == snapshot_id)
            .map(|(volume, _)| volume.clone())
            .collect())
    }

    async fn snapshots_of_volume(&self, volume_id: &str) -> Result<Vec<String>> {
        Ok(self
            .snapshots
            .read()
            .values()
            .filter(|binding| binding.source_volume_id == volume_id)
            .map(|binding| binding.snapshot_id.clone())
            .collect())
    }

    async fn record_volume(&self, volume: &Volume) -> Result<()> {
        self.register_capacity(volume.volume_id.as_str(), volume.capacity_bytes);
        if let Some(snapshot) = &volume.content_source {
            self.register_snapshot_consumer(volume.volume_id.as_str(), snapshot.as_str());
        }
        Ok(())
    }

    async fn forget_volume(&self, volume_id: &str) -> Result<()> {
        self.capacities.write().remove(volume_id);
        self.snapshot_consumers.write().remove(volume_id);
        Ok(())
    }

    async fn record_snapshot(&self, binding: SnapshotBinding) -> Result<()> {
        self.register_snapshot(binding);
        Ok(())
    }

    async fn forget_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.snapshots.write().remove(snapshot_id);
        Ok(())
    }
}
