//! # pitboss-rpc
//!
//! The pitboss wire surfaces, carried as HTTP/1.1 + JSON.
//!
//! - Function RPC (`/rpc/*`): `RpcClient` on the calling side; servers
//!   answer with `ApiError` bodies and stream jobs with `ndjson_response`.
//! - Control (`/control/*`, `/local/*`): `ControlClient` and
//!   `LocalControlClient`.
//! - `serve_until`: the graceful-drain loop every pitboss listener runs.
//!
//! Errors travel as `{code, message, details?}` with the kind's HTTP status;
//! `decode_error` restores the kind on the far side, so a `no_provider`
//! raised at a local instance reaches the admin caller as `no_provider`.

pub mod client;
pub mod control;
pub mod error;
pub mod ndjson;
pub mod serve;

pub use client::{RpcClient, DEFAULT_CONNECT_TIMEOUT};
pub use control::{ControlClient, LocalControlClient};
pub use error::{decode_error, status_for, ApiError, ApiResult};
pub use ndjson::{decode_frames, ndjson_response};
pub use serve::{serve_until, spawn_signal_listener};

/// Route paths shared by servers and clients.
pub mod paths {
    pub const RPC_INVOKE: &str = "/rpc/invoke";
    pub const RPC_START_JOB: &str = "/rpc/start_job";
    pub const RPC_STREAM_JOB: &str = "/rpc/stream_job";
    pub const RPC_CANCEL_JOB: &str = "/rpc/cancel_job";

    pub const LOCAL_REGISTER: &str = "/local/register";
    pub const LOCAL_HEARTBEAT: &str = "/local/heartbeat";
    pub const LOCAL_LIST: &str = "/local/list";

    pub const CONTROL_REGISTER: &str = "/control/register";
    pub const CONTROL_HEARTBEAT: &str = "/control/heartbeat";
    pub const CONTROL_PROVIDER_CAPS: &str = "/control/provider_caps";
}

/// `127.0.0.1:9000` becomes `http://127.0.0.1:9000`; URLs with a scheme are
/// kept. Trailing slashes are dropped.
pub fn base_url(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{routing::post, Json, Router};
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    use pitboss_contracts::{
        error::{CallError, ErrorKind, PitbossError},
        wire::{CancelJobRequest, CancelJobResponse, InvokeRequest, InvokeResponse, JobFrame, JobStreamRequest},
    };

    use super::{base_url, ndjson_response, paths, ApiError, ApiResult, RpcClient};

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn echo_invoke(Json(req): Json<InvokeRequest>) -> ApiResult<InvokeResponse> {
        match req.function_id.as_str() {
            "missing.fn" => Err(ApiError(PitbossError::NoProvider { function_id: req.function_id })),
            "slow.fn" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Json(InvokeResponse { payload: Vec::new() }))
            }
            _ => Ok(Json(InvokeResponse { payload: req.payload })),
        }
    }

    async fn frames(Json(req): Json<JobStreamRequest>) -> axum::response::Response {
        let frames = futures_util::stream::iter(vec![
            JobFrame::progress(50, req.job_id.clone()),
            JobFrame::done(b"finished".to_vec()),
        ]);
        ndjson_response(Box::pin(frames))
    }

    async fn cancel(Json(req): Json<CancelJobRequest>) -> ApiResult<CancelJobResponse> {
        Ok(Json(CancelJobResponse { job_id: req.job_id }))
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route(paths::RPC_INVOKE, post(echo_invoke))
            .route(paths::RPC_STREAM_JOB, post(frames))
            .route(paths::RPC_CANCEL_JOB, post(cancel));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client() -> RpcClient {
        RpcClient::new(Duration::from_secs(1)).unwrap()
    }

    // ── base_url ──────────────────────────────────────────────────────────────

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("127.0.0.1:9000"), "http://127.0.0.1:9000");
        assert_eq!(base_url("https://pitboss.example/"), "https://pitboss.example");
    }

    // ── Function RPC round trips ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_invoke_returns_payload_bytes() {
        let addr = spawn_server().await;
        let req = InvokeRequest::new("player.ban", br#"{"player_id":"u-1"}"#.to_vec());
        let resp = client().invoke(&addr, &req, Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp.payload, br#"{"player_id":"u-1"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_remote_error_keeps_its_kind() {
        let addr = spawn_server().await;
        let req = InvokeRequest::new("missing.fn", Vec::new());
        match client().invoke(&addr, &req, Duration::from_secs(2)).await {
            Err(CallError::Remote(PitbossError::NoProvider { function_id })) => assert_eq!(function_id, "missing.fn"),
            other => panic!("expected a remote no_provider, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_transport_deadline() {
        let addr = spawn_server().await;
        let req = InvokeRequest::new("slow.fn", Vec::new());
        match client().invoke(&addr, &req, Duration::from_millis(50)).await {
            Err(CallError::Transport(e)) => assert_eq!(e.kind(), ErrorKind::DeadlineExceeded),
            other => panic!("expected a transport deadline, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let req = InvokeRequest::new("player.ban", Vec::new());
        match client().invoke(&addr, &req, Duration::from_secs(1)).await {
            Err(CallError::Transport(e)) => assert_eq!(e.kind(), ErrorKind::UpstreamUnavailable),
            other => panic!("expected a transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_and_cancel() {
        let addr = spawn_server().await;
        let frames: Vec<JobFrame> = client()
            .stream_job(&addr, "j42")
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message, "j42");
        assert_eq!(frames[1].payload, b"finished".to_vec());

        let cancel = CancelJobRequest { job_id: "j42".to_string(), reason: String::new() };
        let resp = client().cancel_job(&addr, &cancel, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.job_id, "j42");
    }
}
