//! The agent-facing control surface.

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use chrono::Utc;
use tracing::{debug, info};

use pitboss_contracts::{
    error::PitbossError,
    session::{AgentSession, FunctionState},
    wire::{
        AgentHeartbeatRequest, AgentHeartbeatResponse, AgentRegisterRequest, AgentRegisterResponse,
        ProviderCapsRequest, ProviderCapsResponse,
    },
};
use pitboss_rpc::ApiResult;

use crate::state::AppState;

/// Full registration: replaces the stored function set and labels and
/// renews the session lease.
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<AgentRegisterRequest>, JsonRejection>,
) -> ApiResult<AgentRegisterResponse> {
    let Json(request) = body?;
    if request.agent_id.is_empty() {
        return Err(PitbossError::invalid("agent_id", "must not be empty").into());
    }
    if request.agent_id.contains(':') {
        return Err(PitbossError::invalid("agent_id", "must not contain ':'").into());
    }
    if request.rpc_addr.is_empty() {
        return Err(PitbossError::invalid("rpc_addr", "must not be empty").into());
    }

    let expire_at = Utc::now() + chrono::Duration::from_std(state.agent_ttl).unwrap_or(chrono::Duration::seconds(60));
    let functions = request
        .functions
        .iter()
        .map(|f| (f.id.clone(), FunctionState { enabled: f.enabled }))
        .collect();

    let mut session = AgentSession::new(request.agent_id, request.rpc_addr);
    session.game_id = request.game_id;
    session.env = request.env;
    session.version = request.version;
    session.region = request.region;
    session.zone = request.zone;
    session.labels = Some(request.labels);
    session.functions = Some(functions);
    session.expire_at = Some(expire_at);

    info!(
        agent_id = %session.agent_id,
        game_id = %session.game_id,
        env = %session.env,
        rpc_addr = %session.rpc_addr,
        functions = request.functions.len(),
        "agent registered"
    );
    state.dispatcher.registry().upsert_agent(session);
    Ok(Json(AgentRegisterResponse { expire_at }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    body: Result<Json<AgentHeartbeatRequest>, JsonRejection>,
) -> ApiResult<AgentHeartbeatResponse> {
    let Json(request) = body?;
    let known = state.dispatcher.registry().extend_expiry(&request.agent_id, state.agent_ttl);
    if !known {
        debug!(agent_id = %request.agent_id, "heartbeat from unknown agent");
    }
    Ok(Json(AgentHeartbeatResponse { known }))
}

pub async fn provider_caps(
    State(state): State<AppState>,
    body: Result<Json<ProviderCapsRequest>, JsonRejection>,
) -> ApiResult<ProviderCapsResponse> {
    let Json(request) = body?;
    let updated = state.dispatcher.register_provider_caps(request)?;
    Ok(Json(ProviderCapsResponse { updated }))
}
