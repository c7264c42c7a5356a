//! HTTP API Server
//!
//! REST API for cluster statistics, membership management and
//! backup/restore.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Json, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::Cluster;
use crate::config::ApiConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::state::PeerRole;

/// Shared application state
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, cluster: Arc<Cluster>) -> Self {
        let state = Arc::new(AppState {
            cluster,
            started: Instant::now(),
        });
        Self { config, state }
    }

    /// Build the router with all routes and middleware
    pub fn router(&self) -> Router {
        let cors = if self.config.cors_enabled {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        };

        Router::new()
            .route("/api/v1/stats", get(handle_stats))
            .route(
                "/api/v1/peer",
                get(handle_peers).post(handle_join).delete(handle_remove),
            )
            .route("/api/v1/db/backup", get(handle_backup))
            .route("/api/v1/db/restore", get(handle_restore_file).post(handle_restore_upload))
            .route("/api/v1/db/snapshot", post(handle_snapshot))
            .route("/health", get(handle_health))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(Arc::clone(&self.state))
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Join request
#[derive(Debug, Deserialize, Serialize)]
pub struct JoinRequest {
    pub address: String,
    /// Defaults to the address
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub non_voter: bool,
}

/// Peer selector for removal
#[derive(Debug, Deserialize, Serialize)]
pub struct PeerQuery {
    pub address: String,
}

/// Restore from a file on the node
#[derive(Debug, Deserialize, Serialize)]
pub struct RestoreQuery {
    pub file: String,
    #[serde(default)]
    pub force: bool,
}

/// Restore from an uploaded backup
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub force: bool,
}

/// Generic success response
#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub success: bool,
    pub message: String,
}

/// Snapshot response
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub index: u64,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub role: String,
    pub leader: Option<String>,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Where to retry when this node is not the leader
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

/// Maps crate errors onto HTTP responses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::AlreadyMember | ErrorKind::WouldBreakQuorum | ErrorKind::StaleSnapshot => {
                StatusCode::CONFLICT
            }
            ErrorKind::NotMember => StatusCode::NOT_FOUND,
            ErrorKind::CorruptSnapshot => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Precondition => StatusCode::PRECONDITION_FAILED,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let leader = match &self.0 {
            Error::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        if status.is_server_error() {
            tracing::warn!("API request failed: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.to_string(),
            code: format!("{:?}", kind).to_uppercase(),
            leader,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Handlers ============

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cluster.statistics())
}

async fn handle_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cluster.peers())
}

async fn handle_join(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<Json<OkResponse>> {
    let id = req.id.as_deref().unwrap_or(&req.address);
    let role = if req.non_voter {
        PeerRole::NonVoter
    } else {
        PeerRole::Voter
    };
    state.cluster.join_as(id, &req.address, role).await?;
    Ok(Json(OkResponse {
        success: true,
        message: format!("{} joined", req.address),
    }))
}

async fn handle_remove(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeerQuery>,
) -> ApiResult<Json<OkResponse>> {
    state.cluster.remove(&query.address).await?;
    Ok(Json(OkResponse {
        success: true,
        message: format!("{} removed", query.address),
    }))
}

async fn handle_backup(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let bytes = state.cluster.backup().await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"wolfcluster.backup\"",
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn handle_restore_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RestoreQuery>,
) -> ApiResult<Json<OkResponse>> {
    let bytes = tokio::fs::read(&query.file).await.map_err(Error::from)?;
    state.cluster.restore_with(bytes, query.force).await?;
    Ok(Json(OkResponse {
        success: true,
        message: format!("restored from {}", query.file),
    }))
}

async fn handle_restore_upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<Json<OkResponse>> {
    state.cluster.restore_with(body.to_vec(), query.force).await?;
    Ok(Json(OkResponse {
        success: true,
        message: "restored from upload".into(),
    }))
}

async fn handle_snapshot(State(state): State<Arc<AppState>>) -> ApiResult<Json<SnapshotResponse>> {
    let index = state.cluster.snapshot().await?;
    Ok(Json(SnapshotResponse { index }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.cluster.statistics();
    Json(HealthResponse {
        healthy: stats.leader_id.is_some(),
        node_id: stats.node_id,
        role: stats.role.to_string(),
        leader: stats.leader_address,
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: Error) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_of(Error::NotLeader { leader: None }), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_of(Error::AlreadyMember("a".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(Error::NotMember("a".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(Error::Timeout(4)), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_of(Error::RestoreRejected("busy".into())),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(status_of(Error::CorruptSnapshot("crc".into())), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_join_request_defaults() {
        let req: JoinRequest = serde_json::from_str(r#"{"address":"10.0.0.2:7654"}"#).unwrap();
        assert!(req.id.is_none());
        assert!(!req.non_voter);
    }
}
