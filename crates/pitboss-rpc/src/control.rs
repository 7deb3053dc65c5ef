//! Clients for the two control surfaces.
//!
//! - `ControlClient`: agent to Server, `/control/*`, optionally with a
//!   bearer control token.
//! - `LocalControlClient`: local instance to agent, `/local/*`.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use pitboss_contracts::{
    error::{PitbossError, PitbossResult},
    wire::{
        AgentHeartbeatRequest, AgentHeartbeatResponse, AgentRegisterRequest, AgentRegisterResponse,
        ListLocalResponse, LocalHeartbeatRequest, LocalHeartbeatResponse, ProviderCapsRequest, ProviderCapsResponse,
        RegisterLocalRequest, RegisterLocalResponse,
    },
};

use crate::{base_url, client::transport_error, decode_error, paths};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct JsonClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl JsonClient {
    fn new(addr: &str, token: Option<String>) -> PitbossResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(|e| PitbossError::internal(format!("failed to build control client: {e}")))?;
        Ok(Self { http, base: base_url(addr), token: token.filter(|t| !t.is_empty()) })
    }

    async fn send<Resp: DeserializeOwned>(&self, request: reqwest::RequestBuilder, path: &str) -> PitbossResult<Resp> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(|e| transport_error(&self.base, e).into_inner())?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| transport_error(&self.base, e).into_inner())?;
        if !status.is_success() {
            return Err(decode_error(status.as_u16(), &bytes));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| PitbossError::internal(format!("malformed response from {}{path}: {e}", self.base)))
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(&self, path: &str, body: &Req) -> PitbossResult<Resp> {
        let request = self.http.post(format!("{}{path}", self.base)).json(body);
        self.send(request, path).await
    }

    async fn get<Resp: DeserializeOwned>(&self, path: &str) -> PitbossResult<Resp> {
        let request = self.http.get(format!("{}{path}", self.base));
        self.send(request, path).await
    }
}

/// Agent to Server.
#[derive(Clone)]
pub struct ControlClient {
    inner: JsonClient,
}

impl ControlClient {
    pub fn new(server_url: &str, control_token: Option<String>) -> PitbossResult<Self> {
        Ok(Self { inner: JsonClient::new(server_url, control_token)? })
    }

    pub async fn register(&self, request: &AgentRegisterRequest) -> PitbossResult<AgentRegisterResponse> {
        self.inner.post(paths::CONTROL_REGISTER, request).await
    }

    pub async fn heartbeat(&self, agent_id: &str) -> PitbossResult<AgentHeartbeatResponse> {
        self.inner
            .post(paths::CONTROL_HEARTBEAT, &AgentHeartbeatRequest { agent_id: agent_id.to_string() })
            .await
    }

    pub async fn provider_caps(&self, request: &ProviderCapsRequest) -> PitbossResult<ProviderCapsResponse> {
        self.inner.post(paths::CONTROL_PROVIDER_CAPS, request).await
    }
}

/// Local instance to agent.
#[derive(Clone)]
pub struct LocalControlClient {
    inner: JsonClient,
}

impl LocalControlClient {
    pub fn new(agent_addr: &str) -> PitbossResult<Self> {
        Ok(Self { inner: JsonClient::new(agent_addr, None)? })
    }

    pub async fn register(&self, request: &RegisterLocalRequest) -> PitbossResult<RegisterLocalResponse> {
        self.inner.post(paths::LOCAL_REGISTER, request).await
    }

    pub async fn heartbeat(&self, service_id: &str) -> PitbossResult<LocalHeartbeatResponse> {
        self.inner
            .post(paths::LOCAL_HEARTBEAT, &LocalHeartbeatRequest { service_id: service_id.to_string() })
            .await
    }

    pub async fn list(&self) -> PitbossResult<ListLocalResponse> {
        self.inner.get(paths::LOCAL_LIST).await
    }
}
