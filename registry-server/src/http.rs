//! Boundary adapters: the HTTP surface a client or peer actually talks to.
//! Decodes requests into `registry_core` commands, proposes them through
//! the consensus handle, and maps `registry_core::Error` to the status
//! codes the wire protocol promises.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use registry_core::command::{Command, InstanceRegistration};
use registry_core::consensus::{ConsensusHandle, Proposer};
use registry_core::fsm::Fsm;
use registry_core::state::ServiceRegistry;
use registry_core::time::now_unix_ms;
use registry_core::Error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::transport::TcpTransport;

#[derive(Clone)]
pub struct AppState {
    pub consensus: Arc<ConsensusHandle>,
    pub fsm: Arc<Fsm>,
    pub transport: Arc<TcpTransport>,
}

pub(crate) struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotLeader | Error::Decode(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    id: String,
    addr: String,
}

pub async fn join(State(state): State<AppState>, Json(req): Json<JoinRequest>) -> Result<StatusCode, ApiError> {
    tracing::info!(peer_id = %req.id, peer_addr = %req.addr, "join request received");
    let addr = req
        .addr
        .parse()
        .map_err(|e| ApiError(Error::Decode(format!("invalid peer addr {:?}: {e}", req.addr))))?;
    state.consensus.add_voter(req.id.clone(), req.addr.clone()).await?;
    state.transport.register_peer(req.id, addr);
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    service: String,
    host: String,
    port: u16,
}

pub async fn heartbeat(State(state): State<AppState>, Json(req): Json<HeartbeatRequest>) -> Result<StatusCode, ApiError> {
    let now = now_unix_ms();
    let cmd = Command::Reg(InstanceRegistration {
        service: req.service.clone(),
        host: req.host.clone(),
        port: req.port,
        last_beat_ms: now,
        created_unix_ms: now as i64,
    });
    tracing::info!(service = %req.service, host = %req.host, port = req.port, "heartbeat accepted, proposing REG");
    let bytes = cmd.encode()?;
    state.consensus.propose(bytes).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
pub struct ServicesResponse {
    #[serde(rename = "Services")]
    services: Vec<ServiceView>,
}

#[derive(Debug, Serialize)]
struct ServiceView {
    name: String,
    instances: Vec<InstanceView>,
}

#[derive(Debug, Serialize)]
struct InstanceView {
    host: String,
    port: u16,
    uptime: u64,
}

pub async fn services(State(state): State<AppState>) -> Result<Json<ServicesResponse>, ApiError> {
    let now = now_unix_ms() as i64;
    let services = state
        .fsm
        .state()
        .get_services()
        .into_iter()
        .map(|entry| ServiceView {
            name: entry.name,
            instances: entry
                .instances
                .into_iter()
                .map(|inst| InstanceView {
                    host: inst.host,
                    port: inst.port,
                    uptime: now.saturating_sub(inst.created_unix_ms).max(0) as u64 * 1_000,
                })
                .collect(),
        })
        .collect();
    Ok(Json(ServicesResponse { services }))
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn not_found() -> StatusCode {
    StatusCode::BAD_REQUEST
}
