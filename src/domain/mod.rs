//! Domain layer - Volume model and port definitions
//!
//! The volume model shared by every component, and the traits (ports) that
//! host, network and platform adapters implement.

pub mod ports;
pub mod volume;

pub use ports::*;
pub use volume::*;
