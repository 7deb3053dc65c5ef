//! Registration with the co-located agent.
//!
//! Registers on start, heartbeats every interval, and registers again when
//! the agent answers `known = false` (the agent restarted or pruned us).
//! Failures are logged and retried on the next tick.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pitboss_contracts::{error::PitbossResult, wire::RegisterLocalRequest};
use pitboss_rpc::LocalControlClient;

pub struct Registrar {
    client: LocalControlClient,
    request: RegisterLocalRequest,
    interval: Duration,
}

impl Registrar {
    pub fn new(client: LocalControlClient, request: RegisterLocalRequest, interval: Duration) -> Self {
        Self { client, request, interval }
    }

    pub async fn register(&self) -> PitbossResult<()> {
        let response = self.client.register(&self.request).await?;
        info!(
            service_id = %self.request.service_id,
            session_id = %response.session_id,
            functions = self.request.functions.len(),
            "registered with agent"
        );
        Ok(())
    }

    /// One heartbeat; `Ok(true)` when a re-registration was needed.
    pub async fn tick(&self) -> PitbossResult<bool> {
        let response = self.client.heartbeat(&self.request.service_id).await?;
        if response.known {
            debug!(service_id = %self.request.service_id, "heartbeat acknowledged");
            return Ok(false);
        }
        info!(service_id = %self.request.service_id, "agent lost this instance; registering again");
        self.register().await?;
        Ok(true)
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut registered = match self.register().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "initial agent registration failed");
                false
            }
        };
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("agent registration loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let result = if registered { self.tick().await.map(|_| ()) } else { self.register().await };
                    match result {
                        Ok(()) => registered = true,
                        Err(e) => warn!(error = %e, "agent heartbeat failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pitboss_agent::{AgentConfig, AgentRuntime};
    use pitboss_contracts::wire::LocalFunction;

    use super::*;

    async fn agent() -> (String, Arc<pitboss_agent::LocalStore>, CancellationToken) {
        let config = AgentConfig { listen_addr: "127.0.0.1:0".to_string(), ..AgentConfig::default() };
        let runtime = AgentRuntime::bind(config).await.unwrap();
        let addr = runtime.local_addr().to_string();
        let store = Arc::clone(&runtime.state().store);
        let token = CancellationToken::new();
        tokio::spawn(runtime.run(token.clone()));
        (addr, store, token)
    }

    fn request() -> RegisterLocalRequest {
        RegisterLocalRequest {
            service_id: "svc-1".to_string(),
            version: "0.1.0".to_string(),
            rpc_addr: "127.0.0.1:20100".to_string(),
            functions: vec![LocalFunction { id: "player.ban".to_string(), version: "1.0.0".to_string() }],
        }
    }

    #[tokio::test]
    async fn re_registers_after_the_agent_forgets() {
        let (addr, store, token) = agent().await;
        let registrar = Registrar::new(LocalControlClient::new(&addr).unwrap(), request(), Duration::from_secs(1));

        registrar.register().await.unwrap();
        assert!(!registrar.tick().await.unwrap());

        store.prune_at(Duration::ZERO, chrono::Utc::now() + chrono::Duration::seconds(1));
        assert!(registrar.tick().await.unwrap());
        assert_eq!(store.function_ids(), vec!["player.ban".to_string()]);
        token.cancel();
    }
}
