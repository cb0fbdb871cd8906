//! Local Volume Engine
//!
//! Lifecycle engine for node-local persistent volumes: logical volumes,
//! raw devices, mount points, persistent memory namespaces and quota-limited
//! directories, provisioned from a central controller and consumed on the
//! node that holds them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Controller role                            │
//! │  ┌─────────────┐   ┌────────────────────┐   ┌─────────────────┐  │
//! │  │  REST API   │──▶│ Lifecycle          │──▶│ Scheduling      │──┼──▶ scheduler
//! │  └─────────────┘   │ Controller         │   │ Resolver        │  │
//! │                    │ (idempotency cache)│   └─────────────────┘  │
//! │                    └─────────┬──────────┘                        │
//! └──────────────────────────────┼───────────────────────────────────┘
//!                                │ node agent protocol (JSON/HTTP)
//! ┌──────────────────────────────┼───────────────────────────────────┐
//! │                       Node role                                  │
//! │  ┌─────────────┐   ┌─────────┴──────────┐   ┌─────────────────┐  │
//! │  │  REST API   │──▶│ Node Engine        │──▶│ Primitive Driver│  │
//! │  └─────────────┘   │ (mount / resize)   │   │ lvm pmem quota  │  │
//! │                    └────────────────────┘   └─────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Volume and snapshot lifecycle driven off-node
//! - [`scheduling`]: Placement resolution and the scheduler client
//! - [`agent`]: Node agent protocol, client and server
//! - [`primitive`]: Host tooling drivers for capacity primitives
//! - [`node`]: Publish, unpublish and online expansion on the node
//! - [`api`]: Inbound REST API
//! - [`domain`]: Core domain types and ports
//! - [`error`]: Error types and handling

pub mod agent;
pub mod api;
pub mod catalog;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod node;
pub mod primitive;
pub mod scheduling;

// Re-export commonly used types
pub use agent::{AgentClientConfig, AgentServer, AgentServerConfig, HttpNodeConnector};
pub use api::{ApiServer, ApiServerConfig, RestRouter};
pub use catalog::MemoryCatalog;
pub use controller::{ControllerConfig, LifecycleController};
pub use domain::ports::{
    CommandRunner, Mounter, NodeAgent, NodeConnector, Scheduler, VolumeCatalog,
};
pub use domain::volume::{PrimitiveRef, Volume, VolumeKind};
pub use error::{Error, ErrorAction, ErrorCode, Result};
pub use node::{HostMounter, NodeEngine, NodeEngineConfig};
pub use primitive::{HostCommandRunner, PrimitiveDriver};
pub use scheduling::{HttpScheduler, SchedulerConfig, SchedulingResolver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
