//! Client side of the function RPC surface.
//!
//! One `RpcClient` serves every next hop: the Server uses it to reach
//! agents, the agent to reach local instances. Failures are split the way
//! the retry policy needs them:
//!
//! - no response (connect refused, reset, timeout) is `CallError::Transport`
//! - an error body from the far side is `CallError::Remote`, kind intact

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use pitboss_contracts::{
    error::{CallError, PitbossError},
    wire::{CancelJobRequest, CancelJobResponse, InvokeRequest, InvokeResponse, JobStreamRequest, StartJobResponse},
};
use pitboss_core::traits::FrameStream;

use crate::{base_url, decode_error, ndjson::decode_frames, paths};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
}

impl RpcClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, PitbossError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| PitbossError::internal(format!("failed to build rpc client: {e}")))?;
        Ok(Self { http })
    }

    pub async fn invoke(&self, addr: &str, request: &InvokeRequest, timeout: Duration) -> Result<InvokeResponse, CallError> {
        self.post(addr, paths::RPC_INVOKE, request, Some(timeout)).await
    }

    pub async fn start_job(
        &self,
        addr: &str,
        request: &InvokeRequest,
        timeout: Duration,
    ) -> Result<StartJobResponse, CallError> {
        self.post(addr, paths::RPC_START_JOB, request, Some(timeout)).await
    }

    pub async fn cancel_job(
        &self,
        addr: &str,
        request: &CancelJobRequest,
        timeout: Duration,
    ) -> Result<CancelJobResponse, CallError> {
        self.post(addr, paths::RPC_CANCEL_JOB, request, Some(timeout)).await
    }

    /// Open a job stream. Only the connect phase is bounded; a job may run
    /// for as long as it likes. Dropping the stream closes the connection.
    pub async fn stream_job(&self, addr: &str, job_id: &str) -> Result<FrameStream, CallError> {
        let url = format!("{}{}", base_url(addr), paths::RPC_STREAM_JOB);
        let response = self
            .http
            .post(&url)
            .json(&JobStreamRequest { job_id: job_id.to_string() })
            .send()
            .await
            .map_err(|e| transport_error(addr, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.bytes().await.unwrap_or_default();
            return Err(CallError::Remote(decode_error(status, &body)));
        }
        debug!(addr, job_id, "job stream opened");
        Ok(decode_frames(response.bytes_stream()))
    }

    async fn post<Req, Resp>(&self, addr: &str, path: &str, body: &Req, timeout: Option<Duration>) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", base_url(addr), path);
        let mut request = self.http.post(&url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(|e| transport_error(addr, e))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| transport_error(addr, e))?;
        if !status.is_success() {
            return Err(CallError::Remote(decode_error(status.as_u16(), &bytes)));
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            CallError::Remote(PitbossError::internal(format!("malformed response from {addr}{path}: {e}")))
        })
    }
}

pub(crate) fn transport_error(addr: &str, e: reqwest::Error) -> CallError {
    let err = if e.is_timeout() {
        PitbossError::DeadlineExceeded { reason: format!("{addr}: {e}") }
    } else {
        PitbossError::UpstreamUnavailable { reason: format!("{addr}: {e}") }
    };
    CallError::Transport(err)
}
