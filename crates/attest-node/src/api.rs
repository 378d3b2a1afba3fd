//! HTTP API server for the Attest node.
//!
//! Issuance and revocation answer `202 Accepted` with the pending record;
//! finality is observed through `/verify` or the credential endpoint.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use attest_core::{Credential, CredentialId, DocumentHash, IndexConstraint, LedgerTransaction};
use attest_engine::{Consistency, EngineError, MigrationStatus, Verdict};

use crate::state::NodeState;

// --- Request / response types ---

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub ledger: String,
    pub required_confirmations: u32,
    pub uptime_secs: u64,
}

#[derive(Deserialize)]
pub struct IssueRequest {
    pub id: String,
    /// Hex BLAKE3 hash of the document.
    #[serde(default)]
    pub document_hash: Option<String>,
    /// Raw document content, hashed server-side when no hash is given.
    #[serde(default)]
    pub document: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct VerifyQuery {
    #[serde(default)]
    pub consistency: Option<String>,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize)]
pub struct FieldRequest {
    pub field: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// HTTP status for an engine error.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) | EngineError::InvalidToken => StatusCode::NOT_FOUND,
        EngineError::AlreadyExists(_)
        | EngineError::AlreadyRevoked(_)
        | EngineError::NotYetActive(_)
        | EngineError::MigrationBlocked { .. } => StatusCode::CONFLICT,
        EngineError::LedgerRejected { .. } | EngineError::Migration(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::LedgerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::IndexConflict { .. } | EngineError::Store(_) | EngineError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(err: EngineError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(kind = err.kind(), error = %err, "request failed");
    } else {
        tracing::debug!(kind = err.kind(), error = %err, "request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }),
    )
}

fn parse_id(raw: &str) -> Result<CredentialId, ApiError> {
    CredentialId::new(raw).map_err(|e| api_error(e.into()))
}

// --- Handlers ---

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

async fn handle_status(State(state): State<Arc<NodeState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        ledger: state.ledger_id.clone(),
        required_confirmations: state.engine.config().required_confirmations,
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn handle_issue(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<IssueRequest>,
) -> Result<(StatusCode, Json<Credential>), ApiError> {
    let id = parse_id(&req.id)?;
    let document_hash = match (req.document_hash, req.document) {
        (Some(hash), _) => DocumentHash::parse(&hash).map_err(|e| api_error(e.into()))?,
        (None, Some(document)) => DocumentHash::of(document.as_bytes()),
        (None, None) => {
            return Err(api_error(EngineError::InvalidInput(
                "document_hash or document is required".into(),
            )))
        }
    };
    let credential = state
        .engine
        .issue(id, document_hash)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(credential)))
}

async fn handle_get_credential(
    State(state): State<Arc<NodeState>>,
    Path(raw): Path<String>,
) -> Result<Json<Credential>, ApiError> {
    let id = parse_id(&raw)?;
    match state.engine.credential(&id).await.map_err(api_error)? {
        Some(credential) => Ok(Json(credential)),
        None => Err(api_error(EngineError::NotFound(id.to_string()))),
    }
}

async fn handle_revoke(
    State(state): State<Arc<NodeState>>,
    Path(raw): Path<String>,
) -> Result<(StatusCode, Json<LedgerTransaction>), ApiError> {
    let id = parse_id(&raw)?;
    let tx = state.engine.revoke(id).await.map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(tx)))
}

async fn handle_verify(
    State(state): State<Arc<NodeState>>,
    Path(target): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<Verdict>, ApiError> {
    let consistency = match query.consistency.as_deref() {
        Some(raw) => raw.parse::<Consistency>().map_err(api_error)?,
        None => Consistency::default(),
    };
    let verdict = state
        .engine
        .verify(&target, consistency)
        .await
        .map_err(api_error)?;
    Ok(Json(verdict))
}

async fn handle_constraints(
    State(state): State<Arc<NodeState>>,
) -> Result<Json<MigrationStatus>, ApiError> {
    let status = state.engine.migrations().status().await.map_err(api_error)?;
    Ok(Json(status))
}

async fn handle_rename(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<IndexConstraint>, ApiError> {
    let constraint = state
        .engine
        .migrations()
        .begin_rename(&req.from, &req.to)
        .await
        .map_err(api_error)?;
    Ok(Json(constraint))
}

async fn handle_deprecate(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<FieldRequest>,
) -> Result<Json<IndexConstraint>, ApiError> {
    let constraint = state
        .engine
        .migrations()
        .deprecate(&req.field)
        .await
        .map_err(api_error)?;
    Ok(Json(constraint))
}

async fn handle_finalize(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<FieldRequest>,
) -> Result<Json<IndexConstraint>, ApiError> {
    let constraint = state
        .engine
        .migrations()
        .finalize(&req.field)
        .await
        .map_err(api_error)?;
    Ok(Json(constraint))
}

// --- Server ---

pub fn build_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/credentials", post(handle_issue))
        .route("/api/v1/credentials/{id}", get(handle_get_credential))
        .route("/api/v1/credentials/{id}/revoke", post(handle_revoke))
        .route("/api/v1/verify/{target}", get(handle_verify))
        .route("/api/v1/admin/constraints", get(handle_constraints))
        .route("/api/v1/admin/migrations/rename", post(handle_rename))
        .route("/api/v1/admin/migrations/deprecate", post(handle_deprecate))
        .route("/api/v1/admin/migrations/finalize", post(handle_finalize))
        .with_state(state)
}

pub async fn start_api_server(
    listen_addr: SocketAddr,
    state: Arc<NodeState>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "HTTP API server started");
    axum::serve(listener, app).await?;
    Ok(())
}
