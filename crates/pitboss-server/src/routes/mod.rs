//! The Server's HTTP surface.
//!
//! - `/api/*`: the admin API. Every route needs a valid bearer token and a
//!   matching HTTP rule; the handlers then run the explicit permission and
//!   scope checks through the dispatcher.
//! - `/control/*`: agents registering and heartbeating.
//! - `/healthz`: unauthenticated liveness.

mod approvals;
mod control;
mod dispatch;
mod inventory;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use pitboss_contracts::error::{ForbiddenReason, PitbossError};
use pitboss_rpc::{paths, ApiError};

use crate::auth::bearer_token;
use crate::state::AppState;

pub use dispatch::{headers, DispatchBody, PendingReceipt};

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/invoke", post(dispatch::invoke))
        .route("/api/jobs", post(dispatch::start_job))
        .route("/api/jobs/:handle", delete(dispatch::cancel_job))
        .route("/api/jobs/:handle/stream", get(dispatch::stream_job))
        .route("/api/approvals", get(approvals::list))
        .route("/api/approvals/:id", get(approvals::get_one))
        .route("/api/approvals/:id/approve", post(approvals::approve))
        .route("/api/approvals/:id/reject", post(approvals::reject))
        .route("/api/registry", get(inventory::registry))
        .route("/api/functions", get(inventory::functions))
        .route("/api/providers", get(inventory::list_providers).post(inventory::register_providers))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let control = Router::new()
        .route(paths::CONTROL_REGISTER, post(control::register))
        .route(paths::CONTROL_HEARTBEAT, post(control::heartbeat))
        .route(paths::CONTROL_PROVIDER_CAPS, post(control::provider_caps))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_control_token));

    Router::new()
        .route("/healthz", get(health_check))
        .merge(api)
        .merge(control)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

/// Authenticate the bearer token, apply the HTTP rule layer, and hand the
/// caller to the handler as an extension.
async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response, ApiError> {
    let caller = state.auth.caller_from_headers(request.headers())?;
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    if !state.policy.is_route_allowed(&caller, &method, &path) {
        return Err(PitbossError::forbidden(
            ForbiddenReason::Rbac,
            format!("user '{}' may not call {} {}", caller.user, method, path),
        )
        .into());
    }
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

async fn require_control_token(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, ApiError> {
    if let Some(expected) = &state.control_token {
        if bearer_token(request.headers()) != Some(expected.as_ref()) {
            warn!(path = %request.uri().path(), "control request without a valid token");
            return Err(PitbossError::Unauthenticated { reason: "invalid control token".to_string() }.into());
        }
    }
    Ok(next.run(request).await)
}


#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use tower::util::ServiceExt;

    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn healthz_needs_no_token() {
        let app = build_router(harness().state);
        let response = app.oneshot(request("GET", "/healthz", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"ok".to_vec());
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let app = build_router(harness().state);
        let response = app.oneshot(request("GET", "/api/functions", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn route_without_http_rule_is_403_rbac() {
        let app = build_router(harness().state);
        let response = app.oneshot(request("GET", "/api/registry", Some("bob"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["code"], "forbidden");
        assert_eq!(body["details"]["reason"], "rbac");
    }

    #[tokio::test]
    async fn control_surface_requires_the_control_token() {
        let app = build_router(harness().state);
        let body = serde_json::json!({"agent_id": "a1"});
        let response = app.clone().oneshot(request("POST", "/control/heartbeat", None, Some(body.clone()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/control/heartbeat")
            .header("authorization", "Bearer ctl")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"known": true}));
    }
}
