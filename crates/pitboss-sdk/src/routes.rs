//! The `/rpc/*` surface a local instance serves to its agent.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::debug;

use pitboss_contracts::{
    descriptor::FunctionDescriptor,
    error::{PitbossError, PitbossResult},
    wire::{
        CancelJobRequest, CancelJobResponse, InvokeRequest, InvokeResponse, JobStreamRequest, StartJobResponse,
    },
};
use pitboss_core::traits::PayloadVerifier;
use pitboss_rpc::{ndjson_response, paths, ApiError, ApiResult};

use crate::handler::{CallContext, InvokeHandler, JobHandler};
use crate::job::JobRuntime;

#[derive(Clone)]
pub enum Registered {
    Invoke(Arc<dyn InvokeHandler>),
    Job(Arc<dyn JobHandler>),
}

/// One hosted function.
#[derive(Clone)]
pub struct HostedFunction {
    pub descriptor: FunctionDescriptor,
    pub handler: Registered,
}

#[derive(Clone)]
pub struct InstanceState {
    pub functions: Arc<HashMap<String, HostedFunction>>,
    pub jobs: Arc<JobRuntime>,
    pub verifier: Arc<dyn PayloadVerifier>,
}

impl InstanceState {
    fn lookup(&self, function_id: &str) -> PitbossResult<&HostedFunction> {
        self.functions
            .get(function_id)
            .ok_or_else(|| PitbossError::NoProvider { function_id: function_id.to_string() })
    }

    /// Check the payload against the descriptor's `params` schema.
    fn verify(&self, hosted: &HostedFunction, payload: &[u8]) -> PitbossResult<()> {
        let report = self.verifier.verify(&hosted.descriptor, payload)?;
        if report.passed {
            return Ok(());
        }
        let (field, reason) = report
            .failures
            .into_iter()
            .next()
            .map(|f| (f.field_path, f.message))
            .unwrap_or_else(|| ("$".to_string(), "payload rejected".to_string()));
        Err(PitbossError::InvalidArgument { field, reason })
    }
}

pub fn build_router(state: InstanceState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(paths::RPC_INVOKE, post(invoke))
        .route(paths::RPC_START_JOB, post(start_job))
        .route(paths::RPC_STREAM_JOB, post(stream_job))
        .route(paths::RPC_CANCEL_JOB, post(cancel_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn invoke(
    State(state): State<InstanceState>,
    body: Result<Json<InvokeRequest>, JsonRejection>,
) -> ApiResult<InvokeResponse> {
    let Json(request) = body?;
    let hosted = state.lookup(&request.function_id)?;
    let Registered::Invoke(handler) = &hosted.handler else {
        return Err(PitbossError::invalid("function_id", format!("'{}' is a job; use start_job", request.function_id)).into());
    };
    state.verify(hosted, &request.payload)?;
    debug!(function_id = %request.function_id, "invoking handler");
    let payload = handler.invoke(CallContext::from_request(&request), request.payload).await?;
    Ok(Json(InvokeResponse { payload }))
}

async fn start_job(
    State(state): State<InstanceState>,
    body: Result<Json<InvokeRequest>, JsonRejection>,
) -> ApiResult<StartJobResponse> {
    let Json(request) = body?;
    let hosted = state.lookup(&request.function_id)?;
    let Registered::Job(handler) = &hosted.handler else {
        return Err(PitbossError::invalid("function_id", format!("'{}' is not a job; use invoke", request.function_id)).into());
    };
    state.verify(hosted, &request.payload)?;
    let call = CallContext::from_request(&request);
    let job_id = state.jobs.start(Arc::clone(handler), call, request.payload);
    Ok(Json(StartJobResponse { job_id }))
}

async fn stream_job(
    State(state): State<InstanceState>,
    body: Result<Json<JobStreamRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    Ok(ndjson_response(state.jobs.frames(&request.job_id)?))
}

async fn cancel_job(
    State(state): State<InstanceState>,
    body: Result<Json<CancelJobRequest>, JsonRejection>,
) -> ApiResult<CancelJobResponse> {
    let Json(request) = body?;
    state.jobs.cancel(&request.job_id, &request.reason)?;
    Ok(Json(CancelJobResponse { job_id: request.job_id }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use pitboss_contracts::error::ErrorBody;
    use pitboss_verify::JsonSchemaVerifier;

    use super::*;
    use crate::handler::{invoke_fn, job_fn};
    use crate::job::JobContext;

    fn state() -> InstanceState {
        let mut ban = FunctionDescriptor::new("player.ban");
        ban.params = Some(json!({
            "type": "object",
            "required": ["player_id"],
            "properties": {"player_id": {"type": "string"}}
        }));
        let mut functions = HashMap::new();
        functions.insert(
            "player.ban".to_string(),
            HostedFunction {
                descriptor: ban,
                handler: Registered::Invoke(invoke_fn(|call: CallContext, payload: Vec<u8>| async move {
                    let mut out = call.caller().unwrap_or("anonymous").as_bytes().to_vec();
                    out.push(b'|');
                    out.extend(payload);
                    Ok(out)
                })),
            },
        );
        functions.insert(
            "reports.export".to_string(),
            HostedFunction {
                descriptor: FunctionDescriptor::new("reports.export"),
                handler: Registered::Job(job_fn(|job: JobContext, _payload: Vec<u8>| async move {
                    job.progress(50, "halfway");
                    Ok(b"csv".to_vec())
                })),
            },
        );
        InstanceState {
            functions: Arc::new(functions),
            jobs: Arc::new(JobRuntime::default()),
            verifier: Arc::new(JsonSchemaVerifier::new()),
        }
    }

    fn post_json(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn error_code(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice::<ErrorBody>(&bytes).unwrap().code
    }

    fn request(function_id: &str, payload: &[u8]) -> Value {
        let mut req = InvokeRequest::new(function_id, payload.to_vec());
        req.metadata.insert("caller".to_string(), "alice".to_string());
        serde_json::to_value(req).unwrap()
    }

    #[tokio::test]
    async fn invoke_runs_the_handler_with_call_metadata() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json(paths::RPC_INVOKE, request("player.ban", br#"{"player_id":"u-1"}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let resp: InvokeResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(resp.payload, br#"alice|{"player_id":"u-1"}"#.to_vec());
    }

    #[tokio::test]
    async fn unknown_function_is_no_provider() {
        let app = build_router(state());
        let response = app.oneshot(post_json(paths::RPC_INVOKE, request("player.kick", b""))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "no_provider");
    }

    #[tokio::test]
    async fn schema_violation_is_invalid_argument() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json(paths::RPC_INVOKE, request("player.ban", br#"{"reason":"cheat"}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "invalid_argument");
    }

    #[tokio::test]
    async fn job_functions_refuse_invoke_and_run_as_jobs() {
        let app = build_router(state());
        let response = app
            .clone()
            .oneshot(post_json(paths::RPC_INVOKE, request("reports.export", b"")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post_json(paths::RPC_START_JOB, request("reports.export", b"")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let started: StartJobResponse = serde_json::from_slice(&bytes).unwrap();

        let response = app
            .oneshot(post_json(paths::RPC_STREAM_JOB, json!({"job_id": started.job_id})))
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"type\":\"done\""));
    }

    #[tokio::test]
    async fn cancel_of_unknown_job_is_not_found() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json(paths::RPC_CANCEL_JOB, json!({"job_id": "missing"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
