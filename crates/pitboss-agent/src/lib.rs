//! # pitboss-agent
//!
//! The per-host agent. Local function instances register with it over
//! `/local/*`; the Server reaches those instances through it over `/rpc/*`.
//! Upstream, it registers and heartbeats with the Server so the Server's
//! registry always reflects which functions this host can serve.

pub mod config;
pub mod forwarder;
pub mod job_index;
pub mod local_store;
pub mod routes;
pub mod sync;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pitboss_contracts::error::{PitbossError, PitbossResult};
use pitboss_rpc::{serve_until, ControlClient, RpcClient};

pub use config::AgentConfig;
pub use forwarder::{Forwarder, DEFAULT_CALL_TIMEOUT};
pub use job_index::JobIndex;
pub use local_store::LocalStore;
pub use routes::{build_router, AgentState};
pub use sync::{AgentIdentity, UpstreamSync};

/// A bound agent, ready to run.
pub struct AgentRuntime {
    config: AgentConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    state: AgentState,
}

impl AgentRuntime {
    pub async fn bind(config: AgentConfig) -> PitbossResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| PitbossError::config(format!("cannot listen on '{}': {}", config.listen_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PitbossError::internal(format!("listener has no address: {e}")))?;

        let store = Arc::new(LocalStore::new());
        let client = RpcClient::new(config.connect_timeout())?;
        let forwarder = Forwarder::new(Arc::clone(&store), Arc::new(JobIndex::new()), client, config.call_timeout());
        let state = AgentState::new(store, Arc::new(forwarder));
        Ok(Self { config, listener, local_addr, state })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// The address advertised upstream.
    pub fn advertise_addr(&self) -> String {
        if self.config.advertise_addr.is_empty() {
            self.local_addr.to_string()
        } else {
            self.config.advertise_addr.clone()
        }
    }

    /// Serve until `shutdown` fires. Upstream sync runs alongside and stops
    /// with it.
    pub async fn run(self, shutdown: CancellationToken) -> PitbossResult<()> {
        let control = match &self.config.server_url {
            Some(url) => Some(ControlClient::new(url, self.config.control_token.clone())?),
            None => None,
        };
        let identity = AgentIdentity::from_config(&self.config, self.advertise_addr());
        let sync = UpstreamSync::new(
            identity,
            Arc::clone(&self.state.store),
            control,
            self.config.heartbeat_interval(),
            self.config.local_max_age(),
        );
        let sync_task = tokio::spawn(sync.run(self.state.subscribe(), shutdown.clone()));

        info!(
            addr = %self.local_addr,
            agent_id = %self.config.agent_id,
            upstream = self.config.server_url.as_deref().unwrap_or("none"),
            "agent listening"
        );
        let served = serve_until(self.listener, build_router(self.state), shutdown.clone(), self.config.shutdown_grace()).await;
        shutdown.cancel();
        let _ = sync_task.await;
        served
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn runtime_serves_health_and_stops_on_cancel() {
        let mut config = AgentConfig::default();
        config.listen_addr = "127.0.0.1:0".to_string();
        config.shutdown_grace_secs = 1;
        let runtime = AgentRuntime::bind(config).await.unwrap();
        let addr = runtime.local_addr();
        assert_eq!(runtime.advertise_addr(), addr.to_string());

        let token = CancellationToken::new();
        let task = tokio::spawn(runtime.run(token.clone()));

        let control = pitboss_rpc::LocalControlClient::new(&addr.to_string()).unwrap();
        let listed = control.list().await.unwrap();
        assert!(listed.functions.is_empty());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap().unwrap();
    }
}
