//! Dispatch routes: invoke, start/stream/cancel job.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use pitboss_contracts::{
    descriptor::Route,
    error::{PitbossError, PitbossResult},
    tenant::Caller,
    wire::{CancelJobResponse, JobFrame},
};
use pitboss_core::{Completion, DispatchCall, Dispatched, JobStarted};
use pitboss_rpc::ApiError;

use crate::state::AppState;

/// Request headers the admin API reads.
pub mod headers {
    pub const GAME_ID: &str = "x-game-id";
    pub const ENV: &str = "x-env";
    pub const IDEMPOTENCY_KEY: &str = "x-idempotency-key";
    pub const TRACE_ID: &str = "x-trace-id";
    pub const TIMEOUT_MS: &str = "x-timeout-ms";
}

/// Body of `POST /api/invoke` and `POST /api/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchBody {
    pub function_id: String,
    /// Any JSON value; forwarded as its serialized bytes. `null` forwards
    /// an empty payload.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_key: Option<String>,
}

/// `202` body for a call parked behind the two-person rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReceipt {
    pub approval_id: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    reason: String,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn trace_id(headers: &HeaderMap) -> String {
    header_value(headers, headers::TRACE_ID).unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn build_call(caller: Caller, headers: &HeaderMap, body: DispatchBody) -> PitbossResult<DispatchCall> {
    if body.function_id.trim().is_empty() {
        return Err(PitbossError::invalid("function_id", "must not be empty"));
    }
    let payload = match &body.payload {
        Value::Null => Vec::new(),
        other => serde_json::to_vec(other).map_err(|e| PitbossError::invalid("payload", e.to_string()))?,
    };

    let mut call = DispatchCall::new(caller, body.function_id, payload);
    call.trace_id = trace_id(headers);
    call.game = header_value(headers, headers::GAME_ID);
    call.env = header_value(headers, headers::ENV);
    call.idempotency_key = header_value(headers, headers::IDEMPOTENCY_KEY);
    call.target_service_id = body.target_service_id.filter(|s| !s.is_empty());
    call.hash_key = body.hash_key.filter(|s| !s.is_empty());
    call.route = match body.route.as_deref().filter(|r| !r.is_empty()) {
        Some(r) => Some(Route::parse(r).ok_or_else(|| PitbossError::invalid("route", format!("unknown route '{r}'")))?),
        None => None,
    };
    call.deadline = match header_value(headers, headers::TIMEOUT_MS) {
        Some(ms) => {
            let ms: u64 = ms
                .parse()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| PitbossError::invalid(headers::TIMEOUT_MS, format!("'{ms}' is not a positive integer")))?;
            Some(Duration::from_millis(ms))
        }
        None => None,
    };
    Ok(call)
}

fn with_trace(mut response: Response, trace_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(HeaderName::from_static(headers::TRACE_ID), value);
    }
    response
}

/// The provider's bytes as they came back; `204` when there are none.
pub(crate) fn payload_response(bytes: Vec<u8>) -> Response {
    if bytes.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    let content_type = if serde_json::from_slice::<serde::de::IgnoredAny>(&bytes).is_ok() {
        "application/json"
    } else {
        "application/octet-stream"
    };
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

pub(crate) fn pending_response(approval_id: String) -> Response {
    (StatusCode::ACCEPTED, Json(PendingReceipt { approval_id, state: "pending".to_string() })).into_response()
}

pub(crate) fn completion_response(completion: Completion) -> Response {
    match completion {
        Completion::Payload(bytes) => payload_response(bytes),
        Completion::Job(job) => Json(job).into_response(),
    }
}

pub async fn invoke(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Result<Json<DispatchBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let call = build_call(caller, &headers, body)?;
    let trace = call.trace_id.clone();
    let response = match state.dispatcher.invoke(call).await? {
        Dispatched::Done(bytes) => payload_response(bytes),
        Dispatched::Pending(approval) => pending_response(approval.id),
    };
    Ok(with_trace(response, &trace))
}

pub async fn start_job(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Result<Json<DispatchBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let call = build_call(caller, &headers, body)?;
    let trace = call.trace_id.clone();
    let response = match state.dispatcher.start_job(call).await? {
        Dispatched::Done(job) => Json::<JobStarted>(job).into_response(),
        Dispatched::Pending(approval) => pending_response(approval.id),
    };
    Ok(with_trace(response, &trace))
}

fn frame_event(frame: &JobFrame) -> Event {
    let event = Event::default().event(frame.kind.as_str());
    match serde_json::to_string(frame) {
        Ok(data) => event.data(data),
        Err(_) => event.data("{}"),
    }
}

/// Server-sent events, one per frame, ending with exactly one terminal
/// frame. Disconnecting the client drops the agent connection.
pub async fn stream_job(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(handle): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let frames = state.dispatcher.stream_job(&caller, &handle).await?;
    debug!(job_handle = %handle, user = %caller.user, "streaming job to client");
    let events = frames.map(|frame| Ok::<_, Infallible>(frame_event(&frame)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    Path(handle): Path<String>,
    query: Option<Query<CancelQuery>>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    let reason = query.map(|Query(q)| q.reason).unwrap_or_default();
    let job_id = state
        .dispatcher
        .cancel_job(&caller, &handle, &reason, &trace_id(&headers))
        .await?;
    Ok(Json(CancelJobResponse { job_id }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::util::ServiceExt;

    use super::super::{build_router, test_support::*};

    #[tokio::test]
    async fn invoke_returns_the_provider_bytes_and_audits() {
        let h = harness();
        let app = build_router(h.state.clone());
        let mut req = request(
            "POST",
            "/api/invoke",
            Some("alice"),
            Some(json!({"function_id": "player.ban", "payload": {"player_id": "u-1"}})),
        );
        req.headers_mut().insert("x-game-id", "g1".parse().unwrap());
        req.headers_mut().insert("x-trace-id", "t-123".parse().unwrap());

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-trace-id"], "t-123");
        assert_eq!(body_bytes(response).await, br#"echo:{"player_id":"u-1"}"#.to_vec());

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "ok");
        assert_eq!(h.transport.calls.lock().unwrap().clone(), vec!["invoke:a1:player.ban".to_string()]);
    }

    #[tokio::test]
    async fn scope_denial_names_the_game_and_never_forwards() {
        let h = harness();
        let app = build_router(h.state.clone());
        let mut req = request("POST", "/api/invoke", Some("alice"), Some(json!({"function_id": "player.ban"})));
        req.headers_mut().insert("x-game-id", "g2".parse().unwrap());

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["code"], "forbidden");
        assert_eq!(body["details"]["reason"], "scope_game");
        assert!(h.transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn two_person_call_is_202_with_an_approval_id() {
        let h = harness();
        let app = build_router(h.state.clone());
        let mut req = request("POST", "/api/invoke", Some("alice"), Some(json!({"function_id": "player.wipe"})));
        req.headers_mut().insert("x-game-id", "g1".parse().unwrap());

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["state"], "pending");
        assert!(!body["approval_id"].as_str().unwrap().is_empty());
        assert!(h.transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_timeout_header_is_invalid_argument() {
        let app = build_router(harness().state);
        let mut req = request("POST", "/api/invoke", Some("alice"), Some(json!({"function_id": "player.ban"})));
        req.headers_mut().insert("x-timeout-ms", "soon".parse().unwrap());

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["details"]["field"], "x-timeout-ms");
    }

    #[tokio::test]
    async fn unknown_route_hint_is_invalid_argument() {
        let app = build_router(harness().state);
        let req = request(
            "POST",
            "/api/invoke",
            Some("alice"),
            Some(json!({"function_id": "player.ban", "route": "random"})),
        );
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["details"]["field"], "route");
    }

    #[tokio::test]
    async fn job_start_stream_and_cancel() {
        let h = harness();
        let app = build_router(h.state.clone());

        let response = app
            .clone()
            .oneshot(request("POST", "/api/jobs", Some("alice"), Some(json!({"function_id": "reports.export"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let started = body_json(response).await;
        assert_eq!(started["job_id"], "j42");
        assert_eq!(started["job_handle"], "a1:j42");

        let response = app
            .clone()
            .oneshot(request("GET", "/api/jobs/a1:j42/stream", Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("event: progress"));
        assert!(text.contains("event: done"));
        assert!(!text.contains("upstream_closed"));

        let response = app
            .oneshot(request("DELETE", "/api/jobs/a1:j42?reason=stop", Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"job_id": "j42"}));
        assert!(h.transport.calls.lock().unwrap().contains(&"cancel_job:a1:j42".to_string()));
    }

    #[tokio::test]
    async fn malformed_handle_is_invalid_argument() {
        let app = build_router(harness().state);
        let response = app
            .oneshot(request("DELETE", "/api/jobs/nohandle", Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
