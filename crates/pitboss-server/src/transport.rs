//! The Server-to-agent hop over the HTTP function RPC surface.

use std::time::Duration;

use async_trait::async_trait;

use pitboss_contracts::{
    error::{CallError, PitbossResult},
    session::AgentSession,
    wire::{CancelJobRequest, CancelJobResponse, InvokeRequest, InvokeResponse, StartJobResponse},
};
use pitboss_core::traits::{AgentTransport, FrameStream};
use pitboss_rpc::RpcClient;

#[derive(Clone)]
pub struct HttpAgentTransport {
    client: RpcClient,
}

impl HttpAgentTransport {
    pub fn new(connect_timeout: Duration) -> PitbossResult<Self> {
        Ok(Self { client: RpcClient::new(connect_timeout)? })
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn invoke(
        &self,
        agent: &AgentSession,
        request: InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, CallError> {
        self.client.invoke(&agent.rpc_addr, &request, timeout).await
    }

    async fn start_job(
        &self,
        agent: &AgentSession,
        request: InvokeRequest,
        timeout: Duration,
    ) -> Result<StartJobResponse, CallError> {
        self.client.start_job(&agent.rpc_addr, &request, timeout).await
    }

    async fn stream_job(&self, agent: &AgentSession, job_id: &str) -> Result<FrameStream, CallError> {
        self.client.stream_job(&agent.rpc_addr, job_id).await
    }

    async fn cancel_job(
        &self,
        agent: &AgentSession,
        request: CancelJobRequest,
        timeout: Duration,
    ) -> Result<CancelJobResponse, CallError> {
        self.client.cancel_job(&agent.rpc_addr, &request, timeout).await
    }
}
