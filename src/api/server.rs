//! API Server
//!
//! Serves the REST router with graceful shutdown.

use super::rest::RestRouter;
use crate::controller::LifecycleController;
use crate::error::{Error, Result};
use crate::node::NodeEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST server for the controller, the node engine, or both
pub struct ApiServer {
    config: ApiServerConfig,
    controller: Option<Arc<LifecycleController>>,
    node: Option<Arc<NodeEngine>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            controller: None,
            node: None,
            shutdown_tx,
        }
    }

    pub fn with_controller(mut self, controller: Arc<LifecycleController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<NodeEngine>) -> Self {
        self.node = Some(node);
        self
    }

    /// Run the API server until shutdown is triggered
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.rest_addr;
        let mut router = RestRouter::new();
        if let Some(controller) = &self.controller {
            router = router.with_controller(controller.clone());
        }
        if let Some(node) = &self.node {
            router = router.with_node(node.clone());
        }
        let app = router.build();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
