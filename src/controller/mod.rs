//! Control-Plane Lifecycle Controller
//!
//! Volume and snapshot operations driven from off the node, plus the
//! name-keyed cache that keeps repeated creates idempotent.

pub mod idempotency;
pub mod lifecycle;

pub use idempotency::{CachedVolume, VolumeCache};
pub use lifecycle::{ControllerConfig, LifecycleController};
