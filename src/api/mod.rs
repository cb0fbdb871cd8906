//! Inbound HTTP API
//!
//! REST endpoints over the lifecycle controller and the node engine.

pub mod rest;
pub mod server;

pub use rest::{ApiErrorResponse, RestRouter};
pub use server::{ApiServer, ApiServerConfig};
