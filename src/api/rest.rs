//! REST API Handlers
//!
//! Inbound HTTP surface of the engine: volume and snapshot lifecycle on the
//! controller, publish/unpublish/expand on the node engine.

use crate::controller::LifecycleController;
use crate::domain::volume::{
    CreateSnapshotRequest, CreateVolumeRequest, DeleteVolumeRequest, ExpandVolumeRequest,
    NodeExpandRequest, NodePublishRequest, NodeUnpublishRequest, ReclaimPolicy, VolumeContext,
};
use crate::error::{Error, ErrorCode};
use crate::node::NodeEngine;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Body of a volume delete
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeBody {
    #[serde(default)]
    pub volume_context: VolumeContext,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

/// Body of a controller expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandVolumeBody {
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_context: VolumeContext,
}

/// Result of a node expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExpandResponse {
    pub capacity_bytes: u64,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// HTTP status for an error code
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict | ErrorCode::Aborted => StatusCode::CONFLICT,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    let code = e.code();
    (
        status_for(code),
        Json(ApiErrorResponse {
            error: code.to_string(),
            message: e.to_string(),
            details: e.is_retryable().then(|| "retry with backoff".to_string()),
        }),
    )
        .into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
#[derive(Default)]
pub struct RestRouter {
    controller: Option<Arc<LifecycleController>>,
    node: Option<Arc<NodeEngine>>,
}

impl RestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the volume and snapshot lifecycle
    pub fn with_controller(mut self, controller: Arc<LifecycleController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Serve the node engine
    pub fn with_node(mut self, node: Arc<NodeEngine>) -> Self {
        self.node = Some(node);
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check));

        if let Some(controller) = self.controller {
            router = router.merge(
                Router::new()
                    .route("/v1/volumes", post(create_volume))
                    .route("/v1/volumes/:id", delete(delete_volume))
                    .route("/v1/volumes/:id/expand", post(expand_volume))
                    .route("/v1/snapshots", post(create_snapshot))
                    .route("/v1/snapshots/:id", delete(delete_snapshot))
                    .with_state(controller),
            );
        }
        if let Some(node) = self.node {
            router = router.merge(
                Router::new()
                    .route("/v1/node/publish", post(publish_volume))
                    .route("/v1/node/unpublish", post(unpublish_volume))
                    .route("/v1/node/expand", post(node_expand_volume))
                    .route("/v1/node/info", get(node_info))
                    .with_state(node),
            );
        }

        router.layer(TraceLayer::new_for_http())
    }
}

type ControllerState = State<Arc<LifecycleController>>;
type NodeState = State<Arc<NodeEngine>>;

// =============================================================================
// Controller Handlers
// =============================================================================

async fn create_volume(
    State(controller): ControllerState,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    info!("Creating volume: {}", request.name);
    match controller.create_volume(request).await {
        Ok(volume) => (StatusCode::CREATED, Json(volume)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_volume(
    State(controller): ControllerState,
    Path(id): Path<String>,
    Json(body): Json<DeleteVolumeBody>,
) -> Response {
    info!("Deleting volume: {}", id);
    let request = DeleteVolumeRequest {
        volume_id: id,
        volume_context: body.volume_context,
        reclaim_policy: body.reclaim_policy,
    };
    match controller.delete_volume(request).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn expand_volume(
    State(controller): ControllerState,
    Path(id): Path<String>,
    Json(body): Json<ExpandVolumeBody>,
) -> Response {
    info!("Expanding volume {} to {} bytes", id, body.capacity_bytes);
    let request = ExpandVolumeRequest {
        volume_id: id,
        capacity_bytes: body.capacity_bytes,
        volume_context: body.volume_context,
    };
    match controller.expand_volume(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_snapshot(
    State(controller): ControllerState,
    Json(request): Json<CreateSnapshotRequest>,
) -> Response {
    info!(
        "Creating snapshot {} of {}",
        request.name, request.source_volume_id
    );
    match controller.create_snapshot(request).await {
        Ok(snapshot) => (StatusCode::CREATED, Json(snapshot)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_snapshot(State(controller): ControllerState, Path(id): Path<String>) -> Response {
    info!("Deleting snapshot: {}", id);
    match controller.delete_snapshot(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn publish_volume(
    State(node): NodeState,
    Json(request): Json<NodePublishRequest>,
) -> Response {
    debug!("Publishing {} at {}", request.volume_id, request.target_path);
    match node.publish_volume(request).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn unpublish_volume(
    State(node): NodeState,
    Json(request): Json<NodeUnpublishRequest>,
) -> Response {
    debug!("Unpublishing {} from {}", request.volume_id, request.target_path);
    match node.unpublish_volume(request).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn node_expand_volume(
    State(node): NodeState,
    Json(request): Json<NodeExpandRequest>,
) -> Response {
    match node.expand_volume(request).await {
        Ok(capacity_bytes) => {
            (StatusCode::OK, Json(NodeExpandResponse { capacity_bytes })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn node_info(State(node): NodeState) -> impl IntoResponse {
    (StatusCode::OK, Json(node.node_info()))
}

// =============================================================================
// Probes
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness_check() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{FakeConnector, FakeNodeAgent};
    use crate::catalog::MemoryCatalog;
    use crate::controller::ControllerConfig;
    use crate::domain::ports::CommandOutput;
    use crate::domain::volume::{keys, Volume, GIB};
    use crate::node::{HostMounter, NodeEngineConfig};
    use crate::primitive::command::testing::ScriptedRunner;
    use crate::scheduling::resolver::testing::ScriptedScheduler;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn controller_router() -> (Router, Arc<FakeConnector>) {
        let connector = FakeConnector::new();
        let catalog = MemoryCatalog::new();
        catalog.register_node("node-1", "10.0.0.1");
        let controller = LifecycleController::new(
            ControllerConfig::default(),
            ScriptedScheduler::new("node-1", "vg0"),
            connector.clone(),
            catalog,
        );
        (RestRouter::new().with_controller(controller).build(), connector)
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn create_body(name: &str, volume_type: &str) -> Value {
        json!({
            "name": name,
            "capacityBytes": GIB,
            "parameters": {
                "volumeType": volume_type,
                (keys::CLAIM_NAME): format!("claim-{}", name),
                (keys::CLAIM_NAMESPACE): "apps",
            },
            "capabilities": [{ "accessMode": "singleNodeWriter" }],
        })
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::Aborted), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::Unimplemented), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(status_for(ErrorCode::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_volume_lifecycle_over_http() {
        let (router, connector) = controller_router();

        let (status, body) = call(&router, Method::POST, "/v1/volumes", create_body("pv-1", "LVM")).await;
        assert_eq!(status, StatusCode::CREATED);
        let volume: Volume = serde_json::from_value(body).unwrap();
        assert_eq!(volume.volume_id, "pv-1");
        assert_eq!(connector.agent("10.0.0.1:1736").create_calls(), 1);

        let (status, body) = call(
            &router,
            Method::POST,
            "/v1/volumes/pv-1/expand",
            json!({ "capacityBytes": 2 * GIB, "volumeContext": volume.volume_context }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodeExpansionRequired"], json!(true));

        let (status, _) = call(
            &router,
            Method::DELETE,
            "/v1/volumes/pv-1",
            json!({ "volumeContext": volume.volume_context }),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_errors_carry_codes() {
        let (router, _) = controller_router();

        let (status, body) = call(&router, Method::POST, "/v1/volumes", create_body("pv-1", "NFS")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("invalid_argument"));

        let (status, body) = call(
            &router,
            Method::POST,
            "/v1/snapshots",
            json!({
                "name": "snap-1",
                "sourceVolumeId": "pv-1",
                "sourceContext": { "volumeType": "LVM" },
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["error"], json!("unimplemented"));
    }

    #[tokio::test]
    async fn test_snapshot_guards_over_http() {
        let (router, _) = controller_router();
        let (_, body) = call(&router, Method::POST, "/v1/volumes", create_body("pv-1", "LVM")).await;
        let volume: Volume = serde_json::from_value(body).unwrap();

        let (status, _) = call(
            &router,
            Method::POST,
            "/v1/snapshots",
            json!({
                "name": "snap-1",
                "sourceVolumeId": "pv-1",
                "sourceContext": volume.volume_context,
                "parameters": { (keys::SNAPSHOT_READ_ONLY): "true" },
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(
            &router,
            Method::DELETE,
            "/v1/volumes/pv-1",
            json!({ "volumeContext": volume.volume_context, "reclaimPolicy": "Delete" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("aborted"));

        let (status, _) = call(&router, Method::DELETE, "/v1/snapshots/snap-9", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_503() {
        let (router, connector) = controller_router();
        connector.set_unreachable("10.0.0.1:1736");

        let (status, body) = call(&router, Method::POST, "/v1/volumes", create_body("pv-1", "LVM")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], json!("unavailable"));
        assert!(body["details"].is_string());
    }

    #[tokio::test]
    async fn test_node_routes() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| CommandOutput::ok("")));
        let engine = NodeEngine::new(
            NodeEngineConfig {
                node_id: "node-7".into(),
                ..Default::default()
            },
            FakeNodeAgent::new(),
            Arc::new(HostMounter::new(runner)),
            MemoryCatalog::new(),
        );
        let router = RestRouter::new().with_node(engine).build();

        let request = Request::builder()
            .uri("/v1/node/info")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let info: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(info["nodeId"], json!("node-7"));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let (status, body) = call(
            &router,
            Method::POST,
            "/v1/node/unpublish",
            json!({ "volumeId": "pv-1", "targetPath": missing.to_str().unwrap() }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("not_found"));

        let (status, _) = call(&router, Method::POST, "/v1/volumes", create_body("pv-1", "LVM")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
