//! Read-mostly views of the registry, the function catalog, and provider
//! manifests.

use std::collections::HashMap;

use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use pitboss_contracts::{
    descriptor::FunctionDescriptor,
    session::{AgentSession, ProviderCaps},
    tenant::Caller,
    wire::{ProviderCapsRequest, ProviderCapsResponse},
};
use pitboss_core::permissions;
use pitboss_rpc::ApiResult;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AgentView {
    pub agent_id: String,
    pub game_id: String,
    pub env: String,
    pub rpc_addr: String,
    pub version: String,
    pub region: String,
    pub zone: String,
    pub labels: HashMap<String, String>,
    pub functions: Vec<String>,
    pub expire_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub expires_in_secs: i64,
}

impl AgentView {
    fn at(session: &AgentSession, now: DateTime<Utc>) -> Self {
        let mut functions: Vec<String> = session
            .functions
            .iter()
            .flatten()
            .filter(|(_, state)| state.enabled)
            .map(|(id, _)| id.clone())
            .collect();
        functions.sort();
        let expires_in_secs = session.expire_at.map_or(0, |at| (at - now).num_seconds().max(0));
        Self {
            agent_id: session.agent_id.clone(),
            game_id: session.game_id.clone(),
            env: session.env.clone(),
            rpc_addr: session.rpc_addr.clone(),
            version: session.version.clone(),
            region: session.region.clone(),
            zone: session.zone.clone(),
            labels: session.labels.clone().unwrap_or_default(),
            functions,
            expire_at: session.expire_at,
            healthy: session.is_live_at(now),
            expires_in_secs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FunctionView {
    #[serde(flatten)]
    pub descriptor: FunctionDescriptor,
    /// Live agents currently serving the function.
    pub agents: usize,
}

#[derive(Debug, Serialize)]
pub struct ProviderView {
    pub id: String,
    pub version: String,
    pub lang: String,
    pub sdk: String,
    pub manifest: Value,
    pub updated_at: DateTime<Utc>,
}

impl From<ProviderCaps> for ProviderView {
    fn from(caps: ProviderCaps) -> Self {
        let manifest = serde_json::from_slice(&caps.manifest).unwrap_or(Value::Null);
        Self {
            id: caps.id,
            version: caps.version,
            lang: caps.lang,
            sdk: caps.sdk,
            manifest,
            updated_at: caps.updated_at,
        }
    }
}

/// Every known agent, expired ones included, limited to the caller's games.
pub async fn registry(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Vec<AgentView>> {
    state.dispatcher.authorize(&caller, permissions::REGISTRY_READ, None, None)?;
    let scope = state.scopes.scope_for(&caller);
    let now = Utc::now();
    let agents = state
        .dispatcher
        .registry()
        .list_agents()
        .iter()
        .filter(|s| scope.permits_game(&s.game_id))
        .map(|s| AgentView::at(s, now))
        .collect();
    Ok(Json(agents))
}

pub async fn functions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Vec<FunctionView>> {
    state.dispatcher.authorize(&caller, permissions::REGISTRY_READ, None, None)?;
    let registry = state.dispatcher.registry();
    let views = state
        .dispatcher
        .catalog()
        .list()
        .into_iter()
        .map(|d| FunctionView {
            agents: registry.list_agents_for(&d.id, None, None).len(),
            descriptor: FunctionDescriptor::clone(&d),
        })
        .collect();
    Ok(Json(views))
}

pub async fn list_providers(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Vec<ProviderView>> {
    state.dispatcher.authorize(&caller, permissions::PROVIDERS_READ, None, None)?;
    let providers = state
        .dispatcher
        .registry()
        .list_provider_caps()
        .into_iter()
        .map(ProviderView::from)
        .collect();
    Ok(Json(providers))
}

pub async fn register_providers(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<ProviderCapsRequest>, JsonRejection>,
) -> ApiResult<ProviderCapsResponse> {
    state.dispatcher.authorize(&caller, permissions::PROVIDERS_WRITE, None, None)?;
    let Json(request) = body?;
    let updated = state.dispatcher.register_provider_caps(request)?;
    Ok(Json(ProviderCapsResponse { updated }))
}
