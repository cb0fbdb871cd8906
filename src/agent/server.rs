//! Node agent server
//!
//! Serves the agent protocol for the local [`NodeAgent`] so the off-node
//! controller can drive capacity primitives on this node.

use super::protocol::{
    routes, AgentFailure, CleanPathBody, CreatePrimitiveBody, CreateSnapshotBody,
    DeleteSnapshotBody, ExpandPrimitiveBody, FailureKind, ListLogicalVolumesBody,
    PrimitiveTarget, SetQuotaBody, TagsBody,
};
use crate::domain::ports::NodeAgentRef;
use crate::error::{Error, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Default port of the node agent
pub const DEFAULT_AGENT_PORT: u16 = 1736;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the agent server
#[derive(Debug, Clone)]
pub struct AgentServerConfig {
    /// Bind address
    pub bind_addr: SocketAddr,
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_AGENT_PORT)),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

#[derive(Clone)]
struct AgentState {
    agent: NodeAgentRef,
}

/// Build the agent router around `agent`
pub fn router(agent: NodeAgentRef) -> Router {
    Router::new()
        .route(routes::HEALTH, get(health))
        .route(routes::GET_PRIMITIVE, post(get_primitive))
        .route(routes::CREATE_PRIMITIVE, post(create_primitive))
        .route(routes::DELETE_PRIMITIVE, post(delete_primitive))
        .route(routes::EXPAND_PRIMITIVE, post(expand_primitive))
        .route(routes::LIST_LOGICAL_VOLUMES, post(list_logical_volumes))
        .route(routes::CREATE_SNAPSHOT, post(create_snapshot))
        .route(routes::DELETE_SNAPSHOT, post(delete_snapshot))
        .route(routes::ADD_TAGS, post(add_tags))
        .route(routes::REMOVE_TAGS, post(remove_tags))
        .route(routes::SET_QUOTA, post(set_quota))
        .route(routes::CLEAN_PATH, post(clean_path))
        .layer(TraceLayer::new_for_http())
        .with_state(AgentState { agent })
}

fn reply<T: Serialize>(operation: &str, result: Result<T>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => {
            let failure = AgentFailure::from(&e);
            match failure.kind {
                FailureKind::Internal => error!("{} failed: {}", operation, e),
                _ => warn!("{} failed: {}", operation, e),
            }
            let status = StatusCode::from_u16(failure.kind.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(failure)).into_response()
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn get_primitive(
    State(state): State<AgentState>,
    Json(body): Json<PrimitiveTarget>,
) -> Response {
    reply("get_primitive", state.agent.get_primitive(&body.target).await)
}

async fn create_primitive(
    State(state): State<AgentState>,
    Json(body): Json<CreatePrimitiveBody>,
) -> Response {
    info!("Agent create {}", body.target);
    reply(
        "create_primitive",
        state
            .agent
            .create_primitive(&body.target, &body.options)
            .await,
    )
}

async fn delete_primitive(
    State(state): State<AgentState>,
    Json(body): Json<PrimitiveTarget>,
) -> Response {
    info!("Agent delete {}", body.target);
    reply(
        "delete_primitive",
        state.agent.delete_primitive(&body.target).await,
    )
}

async fn expand_primitive(
    State(state): State<AgentState>,
    Json(body): Json<ExpandPrimitiveBody>,
) -> Response {
    info!("Agent expand {} to {} bytes", body.target, body.size_bytes);
    reply(
        "expand_primitive",
        state
            .agent
            .expand_primitive(&body.target, body.size_bytes)
            .await,
    )
}

async fn list_logical_volumes(
    State(state): State<AgentState>,
    Json(body): Json<ListLogicalVolumesBody>,
) -> Response {
    reply(
        "list_logical_volumes",
        state.agent.list_logical_volumes(&body.vg).await,
    )
}

async fn create_snapshot(
    State(state): State<AgentState>,
    Json(body): Json<CreateSnapshotBody>,
) -> Response {
    info!("Agent snapshot {}/{} of {}", body.vg, body.name, body.source);
    reply(
        "create_snapshot",
        state
            .agent
            .create_snapshot(&body.vg, &body.name, &body.source, body.size_bytes)
            .await,
    )
}

async fn delete_snapshot(
    State(state): State<AgentState>,
    Json(body): Json<DeleteSnapshotBody>,
) -> Response {
    info!("Agent delete snapshot {}/{}", body.vg, body.name);
    reply(
        "delete_snapshot",
        state.agent.delete_snapshot(&body.vg, &body.name).await,
    )
}

async fn add_tags(State(state): State<AgentState>, Json(body): Json<TagsBody>) -> Response {
    reply(
        "add_tags",
        state.agent.add_tags(&body.target, &body.tags).await,
    )
}

async fn remove_tags(State(state): State<AgentState>, Json(body): Json<TagsBody>) -> Response {
    reply(
        "remove_tags",
        state.agent.remove_tags(&body.target, &body.tags).await,
    )
}

async fn set_quota(State(state): State<AgentState>, Json(body): Json<SetQuotaBody>) -> Response {
    reply(
        "set_quota",
        state
            .agent
            .set_quota(&body.path, body.soft_kib, body.hard_kib)
            .await,
    )
}

async fn clean_path(State(state): State<AgentState>, Json(body): Json<CleanPathBody>) -> Response {
    info!("Agent clean {}", body.path);
    reply("clean_path", state.agent.clean_path(&body.path).await)
}

// =============================================================================
// Agent Server
// =============================================================================

/// HTTP server for the node agent
pub struct AgentServer {
    config: AgentServerConfig,
    agent: NodeAgentRef,
    shutdown_tx: broadcast::Sender<()>,
}

impl AgentServer {
    pub fn new(config: AgentServerConfig, agent: NodeAgentRef) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            agent,
            shutdown_tx,
        }
    }

    /// Serve until shutdown is triggered
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.bind_addr;
        let app = router(self.agent.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind node agent on {}: {}", addr, e)))?;
        info!("Node agent listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Node agent shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("Node agent server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
