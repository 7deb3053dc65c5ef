//! The agent's HTTP surface: function RPC from the Server (`/rpc/*`) and
//! local control from instances on the host (`/local/*`).

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use pitboss_contracts::{
    error::PitbossError,
    wire::{
        CancelJobRequest, CancelJobResponse, InvokeRequest, InvokeResponse, JobStreamRequest, ListLocalResponse,
        LocalHeartbeatRequest, LocalHeartbeatResponse, RegisterLocalRequest, RegisterLocalResponse, StartJobResponse,
    },
};
use pitboss_rpc::{ndjson_response, paths, ApiError, ApiResult};

use crate::forwarder::Forwarder;
use crate::local_store::LocalStore;

#[derive(Clone)]
pub struct AgentState {
    pub store: Arc<LocalStore>,
    pub forwarder: Arc<Forwarder>,
    /// Bumped on every local registration change; upstream sync watches it.
    pub changes: Arc<watch::Sender<u64>>,
}

impl AgentState {
    pub fn new(store: Arc<LocalStore>, forwarder: Arc<Forwarder>) -> Self {
        let (changes, _) = watch::channel(0);
        Self { store, forwarder, changes: Arc::new(changes) }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn notify_changed(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}

pub fn build_router(state: AgentState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route(paths::RPC_INVOKE, post(invoke))
        .route(paths::RPC_START_JOB, post(start_job))
        .route(paths::RPC_STREAM_JOB, post(stream_job))
        .route(paths::RPC_CANCEL_JOB, post(cancel_job))
        .route(paths::LOCAL_REGISTER, post(register_local))
        .route(paths::LOCAL_HEARTBEAT, post(heartbeat_local))
        .route(paths::LOCAL_LIST, get(list_local))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Function RPC ─────────────────────────────────────────────────────────────

async fn invoke(
    State(state): State<AgentState>,
    body: Result<Json<InvokeRequest>, JsonRejection>,
) -> ApiResult<InvokeResponse> {
    let Json(request) = body?;
    Ok(Json(state.forwarder.invoke(request).await?))
}

async fn start_job(
    State(state): State<AgentState>,
    body: Result<Json<InvokeRequest>, JsonRejection>,
) -> ApiResult<StartJobResponse> {
    let Json(request) = body?;
    Ok(Json(state.forwarder.start_job(request).await?))
}

async fn stream_job(
    State(state): State<AgentState>,
    body: Result<Json<JobStreamRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let frames = state.forwarder.stream_job(&request.job_id).await?;
    Ok(ndjson_response(frames).into_response())
}

async fn cancel_job(
    State(state): State<AgentState>,
    body: Result<Json<CancelJobRequest>, JsonRejection>,
) -> ApiResult<CancelJobResponse> {
    let Json(request) = body?;
    Ok(Json(state.forwarder.cancel_job(request).await?))
}

// ── Local control ────────────────────────────────────────────────────────────

async fn register_local(
    State(state): State<AgentState>,
    body: Result<Json<RegisterLocalRequest>, JsonRejection>,
) -> ApiResult<RegisterLocalResponse> {
    let Json(request) = body?;
    if request.service_id.trim().is_empty() {
        return Err(PitbossError::invalid("service_id", "must not be empty").into());
    }
    if request.rpc_addr.trim().is_empty() {
        return Err(PitbossError::invalid("rpc_addr", "must not be empty").into());
    }
    let functions: Vec<String> = request.functions.iter().map(|f| f.id.clone()).collect();
    let session_id = state
        .store
        .register(&request.service_id, &request.rpc_addr, &request.version, &functions);
    state.notify_changed();
    Ok(Json(RegisterLocalResponse { session_id }))
}

async fn heartbeat_local(
    State(state): State<AgentState>,
    body: Result<Json<LocalHeartbeatRequest>, JsonRejection>,
) -> ApiResult<LocalHeartbeatResponse> {
    let Json(request) = body?;
    let known = state.store.heartbeat(&request.service_id);
    if known {
        debug!(service_id = %request.service_id, "local heartbeat");
    } else {
        warn!(service_id = %request.service_id, "heartbeat from unregistered service");
    }
    Ok(Json(LocalHeartbeatResponse { known }))
}

async fn list_local(State(state): State<AgentState>) -> Json<ListLocalResponse> {
    Json(ListLocalResponse { functions: state.store.list() })
}
