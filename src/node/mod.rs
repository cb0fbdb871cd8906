//! Node-Side Mount/Resize Engine
//!
//! Publishing, unpublishing and online growth of volumes on the node that
//! owns them, plus the host implementation of the mount port.

pub mod engine;
pub mod mounter;

pub use engine::{NodeEngine, NodeEngineConfig};
pub use mounter::HostMounter;
