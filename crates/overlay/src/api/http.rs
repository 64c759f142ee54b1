//! HTTP management API
//!
//! RESTful rendition of the overlay commands

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::OverlayError;
use crate::metadata::{
    ChunkId, ChunkRecord, NodeId, NodeInfo, NodeRole, ShardSummary, SummaryScope,
};
use crate::node_manager::RegisterResult;
use crate::scheduler::{DepartureOutcome, MigrationTask};
use crate::Overlay;

/// HTTP API service
pub struct HttpApi {
    overlay: Arc<Overlay>,
}

impl HttpApi {
    pub fn new(overlay: Arc<Overlay>) -> Self {
        Self { overlay }
    }

    /// Build the router
    pub fn router(self) -> Router {
        Router::new()
            // Nodes
            .route("/api/v1/nodes", get(list_nodes).post(join_node))
            .route("/api/v1/nodes/:node_id/heartbeat", post(node_heartbeat))
            .route("/api/v1/nodes/:node_id/shutdown", post(shutdown_node))
            .route("/api/v1/nodes/:node_id/reactivate", post(reactivate_node))
            .route("/api/v1/nodes/:node_id/chunks", get(list_node_chunks))
            // Metadata
            .route("/api/v1/metadata/summary", get(metadata_summary))
            // Chunks
            .route("/api/v1/chunks", post(create_chunks))
            .route("/api/v1/chunks/:chunk_id", get(get_chunk).delete(remove_chunk))
            .route("/api/v1/chunks/:chunk_id/migrate", post(migrate_chunk))
            // Names
            .route("/api/v1/names", get(list_names).post(register_name))
            .route("/api/v1/names/:name", get(resolve_name))
            // Temporary storage
            .route("/api/v1/tmp", get(tmp_status).post(tmp_create))
            // Migration tasks
            .route("/api/v1/migrations", get(list_migrations))
            .route("/api/v1/migrations/:task_id", delete(cancel_migration))
            .with_state(self.overlay)
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

fn status_of(error: &OverlayError) -> StatusCode {
    match error {
        OverlayError::UnknownNode(_)
        | OverlayError::NotFound(_)
        | OverlayError::UnknownChunk(_) => StatusCode::NOT_FOUND,
        OverlayError::Conflict(_)
        | OverlayError::AlreadyRegistered(_)
        | OverlayError::OwnershipMismatch { .. }
        | OverlayError::InvalidTransition { .. }
        | OverlayError::MigrationCancelled(_) => StatusCode::CONFLICT,
        OverlayError::KeyOutOfRange { .. } => StatusCode::BAD_REQUEST,
        OverlayError::NoCapacity { .. }
        | OverlayError::TargetUnavailable(_)
        | OverlayError::NoSuperpeer => StatusCode::SERVICE_UNAVAILABLE,
        OverlayError::MigrationFailed { .. } | OverlayError::ShutdownIncomplete { .. } => {
            StatusCode::BAD_GATEWAY
        }
        OverlayError::DataLoss { .. }
        | OverlayError::RoutingExceeded { .. }
        | OverlayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error with the chunk list some errors carry
fn error_message(error: &OverlayError) -> String {
    match error {
        OverlayError::ShutdownIncomplete { chunks } | OverlayError::DataLoss { chunks } => {
            let ids: Vec<_> = chunks.iter().map(|c| c.to_string()).collect();
            format!("{}: [{}]", error, ids.join(", "))
        }
        _ => error.to_string(),
    }
}

fn fail<T: Serialize>(error: OverlayError) -> (StatusCode, Json<ApiResponse<T>>) {
    (status_of(&error), ApiResponse::err(error_message(&error)))
}

fn bad_request<T: Serialize>(msg: impl Into<String>) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::BAD_REQUEST, ApiResponse::err(msg))
}

// ==================== Request types ====================

#[derive(Deserialize)]
struct JoinRequest {
    node_id: String,
    role: NodeRole,
    addr: String,
    /// Defaults to the configured peer capacity
    capacity_bytes: Option<u64>,
}

#[derive(Serialize)]
struct JoinResponse {
    is_new: bool,
}

#[derive(Deserialize)]
struct SummaryQuery {
    scope: Option<String>,
}

#[derive(Deserialize)]
struct CreateChunksRequest {
    count: usize,
    node_id: Option<String>,
    size: Option<u64>,
}

#[derive(Deserialize)]
struct RegisterNameRequest {
    table_id: String,
    key: u64,
    name: String,
}

#[derive(Serialize)]
struct ResolveResponse {
    name: String,
    chunk: ChunkId,
    owner: NodeId,
}

#[derive(Deserialize)]
struct MigrateRequest {
    target: String,
    source: String,
}

#[derive(Deserialize)]
struct ShutdownRequest {
    #[serde(default = "default_graceful")]
    graceful: bool,
}

fn default_graceful() -> bool {
    true
}

#[derive(Serialize)]
struct ShutdownResponse {
    node: NodeId,
    /// "removed" or "recovering"
    state: &'static str,
    migrated: Vec<(ChunkId, NodeId)>,
}

#[derive(Deserialize)]
struct ChunkListQuery {
    #[serde(default)]
    migrated: bool,
}

#[derive(Deserialize)]
struct TmpCreateRequest {
    id: u32,
    size: u64,
}

#[derive(Serialize)]
struct TmpCreateResponse {
    id: u32,
    superpeer: NodeId,
}

// ==================== Handlers ====================

// Nodes
async fn list_nodes(State(overlay): State<Arc<Overlay>>) -> impl IntoResponse {
    let nodes: Vec<NodeInfo> = overlay.node_listing().await.iter().cloned().collect();
    ApiResponse::ok(nodes)
}

async fn join_node(
    State(overlay): State<Arc<Overlay>>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    let node_id = match req.node_id.parse::<NodeId>() {
        Ok(id) => id,
        Err(e) => return bad_request::<JoinResponse>(e.to_string()),
    };
    let capacity = req
        .capacity_bytes
        .unwrap_or(overlay.config().placement.default_capacity_bytes);
    let node = NodeInfo::new(node_id, req.role, req.addr).with_capacity(capacity);

    match overlay.join(node).await {
        Ok(result) => {
            if let Err(e) = overlay.save().await {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiResponse::<JoinResponse>::err(e.to_string()),
                );
            }
            info!("Node {} joined via HTTP API", node_id);
            let is_new = result == RegisterResult::NewNode;
            (StatusCode::CREATED, ApiResponse::ok(JoinResponse { is_new }))
        }
        Err(e) => fail(e),
    }
}

async fn node_heartbeat(
    State(overlay): State<Arc<Overlay>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let node_id = match node_id.parse::<NodeId>() {
        Ok(id) => id,
        Err(e) => return bad_request::<()>(e.to_string()),
    };
    match overlay.heartbeat(node_id).await {
        Ok(()) => (StatusCode::OK, ApiResponse::ok(())),
        Err(e) => fail(e),
    }
}

async fn shutdown_node(
    State(overlay): State<Arc<Overlay>>,
    Path(node_id): Path<String>,
    body: Option<Json<ShutdownRequest>>,
) -> impl IntoResponse {
    let node_id = match node_id.parse::<NodeId>() {
        Ok(id) => id,
        Err(e) => return bad_request::<ShutdownResponse>(e.to_string()),
    };
    let graceful = body.map(|Json(req)| req.graceful).unwrap_or(true);

    let response = match overlay.node_shutdown(node_id, graceful).await {
        Ok(DepartureOutcome::Removed { migrated }) => ShutdownResponse {
            node: node_id,
            state: "removed",
            migrated,
        },
        // Recovery keeps running detached from the request
        Ok(DepartureOutcome::Recovering(recovery)) => ShutdownResponse {
            node: recovery.node(),
            state: "recovering",
            migrated: Vec::new(),
        },
        Err(e) => {
            warn!("Shutdown of {} via HTTP API failed: {}", node_id, e);
            return fail(e);
        }
    };
    // The departure already happened; a failed save only delays persisting it
    if let Err(e) = overlay.save().await {
        warn!("Snapshot after shutdown of {} failed: {}", node_id, e);
    }
    (StatusCode::OK, ApiResponse::ok(response))
}

async fn reactivate_node(
    State(overlay): State<Arc<Overlay>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let node_id = match node_id.parse::<NodeId>() {
        Ok(id) => id,
        Err(e) => return bad_request::<()>(e.to_string()),
    };
    match overlay.node_reactivate(node_id).await {
        Ok(()) => {
            info!("Node {} reactivated via HTTP API", node_id);
            (StatusCode::OK, ApiResponse::ok(()))
        }
        Err(e) => fail(e),
    }
}

async fn list_node_chunks(
    State(overlay): State<Arc<Overlay>>,
    Path(node_id): Path<String>,
    Query(query): Query<ChunkListQuery>,
) -> impl IntoResponse {
    let node_id = match node_id.parse::<NodeId>() {
        Ok(id) => id,
        Err(e) => return bad_request::<Vec<ChunkId>>(e.to_string()),
    };
    match overlay.chunklist(node_id, query.migrated).await {
        Ok(chunks) => (StatusCode::OK, ApiResponse::ok(chunks)),
        Err(e) => fail(e),
    }
}

// Metadata
async fn metadata_summary(
    State(overlay): State<Arc<Overlay>>,
    Query(query): Query<SummaryQuery>,
) -> impl IntoResponse {
    let scope = match query.scope.as_deref().unwrap_or("all").parse::<SummaryScope>() {
        Ok(scope) => scope,
        Err(e) => return bad_request::<Vec<ShardSummary>>(e.to_string()),
    };
    match overlay.metadata_summary(scope) {
        Ok(summary) => (StatusCode::OK, ApiResponse::ok(summary)),
        Err(e) => fail(e),
    }
}

// Chunks
async fn create_chunks(
    State(overlay): State<Arc<Overlay>>,
    Json(req): Json<CreateChunksRequest>,
) -> impl IntoResponse {
    let preferred = match req.node_id.as_deref().map(str::parse::<NodeId>).transpose() {
        Ok(node) => node,
        Err(e) => return bad_request::<Vec<ChunkId>>(e.to_string()),
    };
    match overlay.chunk_create(req.count, req.size, preferred).await {
        Ok(chunks) => (StatusCode::CREATED, ApiResponse::ok(chunks)),
        Err(e) => fail(e),
    }
}

async fn get_chunk(
    State(overlay): State<Arc<Overlay>>,
    Path(chunk_id): Path<String>,
) -> impl IntoResponse {
    let chunk = match chunk_id.parse::<ChunkId>() {
        Ok(id) => id,
        Err(e) => return bad_request::<ChunkRecord>(e.to_string()),
    };
    match overlay.directory().record(chunk).await {
        Ok(record) => (StatusCode::OK, ApiResponse::ok(record)),
        Err(e) => fail(e),
    }
}

async fn remove_chunk(
    State(overlay): State<Arc<Overlay>>,
    Path(chunk_id): Path<String>,
) -> impl IntoResponse {
    let chunk = match chunk_id.parse::<ChunkId>() {
        Ok(id) => id,
        Err(e) => return bad_request::<ChunkRecord>(e.to_string()),
    };
    match overlay.remove_chunk(chunk).await {
        Ok(record) => (StatusCode::OK, ApiResponse::ok(record)),
        Err(e) => fail(e),
    }
}

async fn migrate_chunk(
    State(overlay): State<Arc<Overlay>>,
    Path(chunk_id): Path<String>,
    Json(req): Json<MigrateRequest>,
) -> impl IntoResponse {
    let parsed = chunk_id
        .parse::<ChunkId>()
        .and_then(|chunk| Ok((chunk, req.target.parse::<NodeId>()?, req.source.parse::<NodeId>()?)));
    let (chunk, target, source) = match parsed {
        Ok(ids) => ids,
        Err(e) => return bad_request::<MigrationTask>(e.to_string()),
    };
    match overlay.chunk_migrate(chunk, target, source).await {
        Ok(task) => (StatusCode::OK, ApiResponse::ok(task)),
        Err(e) => fail(e),
    }
}

// Names
async fn list_names(State(overlay): State<Arc<Overlay>>) -> impl IntoResponse {
    ApiResponse::ok(overlay.namelist())
}

async fn register_name(
    State(overlay): State<Arc<Overlay>>,
    Json(req): Json<RegisterNameRequest>,
) -> impl IntoResponse {
    let table = match req.table_id.parse::<NodeId>() {
        Ok(id) => id,
        Err(e) => return bad_request::<ChunkId>(e.to_string()),
    };
    match overlay.namereg(table.0, req.key, &req.name) {
        Ok(chunk) => (StatusCode::CREATED, ApiResponse::ok(chunk)),
        Err(e) => fail(e),
    }
}

async fn resolve_name(
    State(overlay): State<Arc<Overlay>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let chunk = match overlay.resolve(&name) {
        Ok(chunk) => chunk,
        Err(e) => return fail::<ResolveResponse>(e),
    };
    match overlay.lookup_owner(chunk).await {
        Ok(owner) => (
            StatusCode::OK,
            ApiResponse::ok(ResolveResponse { name, chunk, owner }),
        ),
        Err(e) => fail(e),
    }
}

// Temporary storage
async fn tmp_create(
    State(overlay): State<Arc<Overlay>>,
    Json(req): Json<TmpCreateRequest>,
) -> impl IntoResponse {
    match overlay.tmp_create(req.id, req.size) {
        Ok(superpeer) => (
            StatusCode::CREATED,
            ApiResponse::ok(TmpCreateResponse {
                id: req.id,
                superpeer,
            }),
        ),
        Err(e) => fail(e),
    }
}

async fn tmp_status(State(overlay): State<Arc<Overlay>>) -> impl IntoResponse {
    ApiResponse::ok(overlay.tmp_status())
}

// Migration tasks
async fn list_migrations(State(overlay): State<Arc<Overlay>>) -> impl IntoResponse {
    ApiResponse::ok(overlay.migrations())
}

async fn cancel_migration(
    State(overlay): State<Arc<Overlay>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match overlay.cancel_migration(&task_id) {
        Ok(outcome) => (StatusCode::OK, ApiResponse::ok(outcome)),
        Err(e) => fail(e),
    }
}
