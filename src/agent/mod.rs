//! Node Agent Protocol
//!
//! Request/response contract that exposes the capacity-primitive driver of
//! a node to the off-node controller, as JSON over HTTP.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{with_default_port, AgentClientConfig, AgentConnection, HttpNodeConnector};
pub use protocol::{AgentFailure, FailureKind};
pub use server::{AgentServer, AgentServerConfig, DEFAULT_AGENT_PORT};

// =============================================================================
// Test Support
// =============================================================================
