//! Scheduling Resolver
//!
//! Placement of new volumes, either taken from the request or obtained
//! from the external scheduler.

pub mod client;
pub mod resolver;

pub use client::{HttpScheduler, SchedulerConfig, DEFAULT_SCHEDULER_HOST};
pub use resolver::{pick_node, SchedulingResolver};
