//! Idempotency cache
//!
//! Volumes created by this controller, keyed by name, so a repeated create
//! returns the first result without touching the node again. Entries are
//! evicted once the volume is deleted.

use crate::domain::volume::{Volume, VolumeState};
use crate::error::Result;
use dashmap::DashMap;

/// Cached volume and where it is in its lifecycle
#[derive(Debug, Clone)]
pub struct CachedVolume {
    pub volume: Volume,
    pub state: VolumeState,
}

/// Controller-scoped cache of created volumes
#[derive(Debug, Default)]
pub struct VolumeCache {
    entries: DashMap<String, CachedVolume>,
}

impl VolumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Created volume for `name`, ignoring entries being deleted
    pub fn get(&self, name: &str) -> Option<Volume> {
        self.entries
            .get(name)
            .filter(|entry| entry.state == VolumeState::PrimitiveCreated)
            .map(|entry| entry.volume.clone())
    }

    /// Remember a freshly created volume
    pub fn record(&self, volume: Volume) {
        self.entries.insert(
            volume.volume_id.clone(),
            CachedVolume {
                volume,
                state: VolumeState::PrimitiveCreated,
            },
        );
    }

    /// Move a cached volume to `next`; unknown volumes are ignored
    pub fn advance(&self, name: &str, next: VolumeState) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(name) {
            if entry.state != next {
                entry.state = entry.state.transition(next)?;
            }
        }
        Ok(())
    }

    pub fn evict(&self, name: &str) -> Option<CachedVolume> {
        self.entries.remove(name).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
