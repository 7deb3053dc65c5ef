//! Approval routes: list, inspect, approve, reject.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::HeaderMap,
    response::Response,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pitboss_contracts::{
    approval::{Approval, ApprovalFilter, ApprovalMode, ApprovalState, PageRequest, SortOrder},
    error::{PitbossError, PitbossResult},
    tenant::Caller,
};
use pitboss_rpc::{ApiError, ApiResult};

use super::dispatch::{completion_response, trace_id};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    state: Option<String>,
    function_id: Option<String>,
    game_id: Option<String>,
    env: Option<String>,
    actor: Option<String>,
    mode: Option<String>,
    page: Option<u32>,
    size: Option<u32>,
    sort: Option<String>,
}

impl ListQuery {
    fn into_request(self) -> PitbossResult<(ApprovalFilter, PageRequest)> {
        fn text(v: Option<String>) -> Option<String> {
            v.filter(|s| !s.is_empty())
        }
        let state = match text(self.state) {
            Some(s) => Some(ApprovalState::parse(&s).ok_or_else(|| PitbossError::invalid("state", format!("unknown state '{s}'")))?),
            None => None,
        };
        let mode = match text(self.mode) {
            Some(m) => Some(ApprovalMode::parse(&m).ok_or_else(|| PitbossError::invalid("mode", format!("unknown mode '{m}'")))?),
            None => None,
        };
        let sort = match text(self.sort) {
            Some(s) => SortOrder::parse(&s).ok_or_else(|| PitbossError::invalid("sort", format!("unknown sort '{s}'")))?,
            None => SortOrder::default(),
        };
        let filter = ApprovalFilter {
            state,
            function_id: text(self.function_id),
            game_id: text(self.game_id),
            env: text(self.env),
            actor: text(self.actor),
            mode,
            games: None,
        };
        let page = PageRequest::new(self.page.unwrap_or(1), self.size.unwrap_or(PageRequest::DEFAULT_SIZE), sort);
        Ok((filter, page))
    }
}

#[derive(Debug, Serialize)]
pub struct ApprovalPage {
    pub items: Vec<Approval>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

#[derive(Debug, Serialize)]
pub struct ApprovalView {
    #[serde(flatten)]
    pub approval: Approval,
    /// The stored payload with sensitive fields masked; `null` when it is
    /// not JSON.
    pub payload_preview: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    reason: String,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<ApprovalPage> {
    let Query(query) = query.map_err(|e| PitbossError::invalid("query", e.body_text()))?;
    let (filter, page) = query.into_request()?;
    let (items, total) = state.dispatcher.list_approvals(&caller, filter, page).await?;
    Ok(Json(ApprovalPage { items, total, page: page.page, size: page.size }))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<ApprovalView> {
    let approval = state.dispatcher.get_approval(&caller, &id).await?;
    let payload_preview = state.dispatcher.approval_preview(&approval);
    Ok(Json(ApprovalView { approval, payload_preview }))
}

/// Approve and execute; answers with the shapes of the original call.
pub async fn approve(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (_, completion) = state.dispatcher.approve(&caller, &id, &trace_id(&headers)).await?;
    Ok(completion_response(completion))
}

pub async fn reject(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> ApiResult<Approval> {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_default();
    let rejected = state.dispatcher.reject(&caller, &id, &reason, &trace_id(&headers)).await?;
    Ok(Json(rejected))
}
