use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use meshradio_network::{ConnectionOrchestrator, NetworkError, SignalingMode};
use meshradio_protocol::{ApplicationMessage, Destination, MessageKind, ProtocolError};
use meshradio_routing::MeshStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiConfig;
use crate::inbox::Inbox;

/// API server state
pub struct ApiState {
    pub name: String,
    pub orchestrator: ConnectionOrchestrator,
    pub inbox: Arc<Inbox>,
    pub started_at: Instant,
}

/// API server
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: Arc<ApiState>) -> Self {
        Self { config, state }
    }

    pub async fn start(&self) -> Result<tokio::task::JoinHandle<Result<()>>> {
        let app = router(self.state.clone());

        let bind_addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await?;

        info!("API server listening on {}", listener.local_addr()?);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .map_err(|e| anyhow::anyhow!("Server error: {}", e))
        });

        Ok(handle)
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/node/info", get(get_node_info))
        .route("/api/v1/peers", get(list_peers))
        .route("/api/v1/routes", get(list_routes))
        .route("/api/v1/messages", get(list_messages).post(send_message))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// === Errors ===

enum ApiError {
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl From<NetworkError> for ApiError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::ShutDown => ApiError::Unavailable(e.to_string()),
            NetworkError::Protocol(ProtocolError::MessageTooLarge { .. }) => {
                ApiError::BadRequest(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// === Health Check ===

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// === Node Endpoints ===

async fn get_node_info(State(state): State<Arc<ApiState>>) -> Json<NodeInfoResponse> {
    let orchestrator = &state.orchestrator;
    Json(NodeInfoResponse {
        node_id: orchestrator.local_id().to_string(),
        name: state.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        signaling: orchestrator.signaling_mode().await,
        peer_count: orchestrator.peer_count().await,
        pending_negotiations: orchestrator.pending_count().await,
        stats: orchestrator.node().stats().await,
    })
}

#[derive(Serialize)]
struct NodeInfoResponse {
    node_id: String,
    name: String,
    version: String,
    uptime_secs: u64,
    signaling: SignalingMode,
    peer_count: usize,
    pending_negotiations: usize,
    stats: MeshStats,
}

async fn list_peers(State(state): State<Arc<ApiState>>) -> Json<Vec<String>> {
    let peers = state.orchestrator.node().peers().await;
    Json(peers.into_iter().map(|id| id.to_string()).collect())
}

async fn list_routes(State(state): State<Arc<ApiState>>) -> Json<Vec<RouteInfo>> {
    let routes = state.orchestrator.node().routes().await;
    Json(
        routes
            .into_iter()
            .map(|(destination, entry)| RouteInfo {
                destination: destination.to_string(),
                next_hop: entry.next_hop.to_string(),
                hop_count: entry.hop_count,
            })
            .collect(),
    )
}

#[derive(Serialize)]
struct RouteInfo {
    destination: String,
    next_hop: String,
    hop_count: u32,
}

// === Message Endpoints ===

#[derive(Deserialize)]
struct ListMessagesQuery {
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListMessagesQuery>,
) -> Json<Vec<ApplicationMessage>> {
    Json(state.inbox.recent(query.limit.unwrap_or(50)).await)
}

#[derive(Deserialize)]
struct SendMessageRequest {
    /// Node ID, or omitted / `"broadcast"` for everyone
    destination: Option<String>,
    payload: String,
    #[serde(default)]
    kind: MessageKind,
}

#[derive(Serialize)]
struct SendMessageResponse {
    sender: String,
    destination: String,
    timestamp: u64,
    kind: MessageKind,
}

async fn send_message(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SendMessageRequest>,
) -> std::result::Result<(StatusCode, Json<SendMessageResponse>), ApiError> {
    let destination = match request.destination.as_deref() {
        None => Destination::Broadcast,
        Some(raw) => raw
            .parse::<Destination>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
    };

    let message = match destination {
        Destination::Broadcast => {
            state
                .orchestrator
                .send_message(request.payload, request.kind)
                .await?
        }
        Destination::Node(target) => {
            state
                .orchestrator
                .send_to(target, request.payload, request.kind)
                .await?
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(SendMessageResponse {
            sender: message.sender.to_string(),
            destination: message.destination.as_str().to_string(),
            timestamp: message.timestamp,
            kind: message.kind,
        }),
    ))
}
