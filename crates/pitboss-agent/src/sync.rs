//! Upstream sync: keeps the Server's view of this agent current.
//!
//! - registers on start and after every local registration change
//! - every heartbeat tick: prune stale local instances, heartbeat the
//!   Server, re-register when the Server answers `known = false`
//!
//! A failed heartbeat is not retried; the next tick subsumes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pitboss_contracts::{
    error::PitbossResult,
    wire::{AgentFunction, AgentRegisterRequest},
};
use pitboss_rpc::ControlClient;

use crate::config::AgentConfig;
use crate::local_store::LocalStore;

/// Who this agent is, as reported upstream.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub game_id: String,
    pub env: String,
    pub rpc_addr: String,
    pub version: String,
    pub region: String,
    pub zone: String,
    pub labels: HashMap<String, String>,
}

impl AgentIdentity {
    pub fn from_config(config: &AgentConfig, rpc_addr: impl Into<String>) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            game_id: config.game_id.clone(),
            env: config.env.clone(),
            rpc_addr: rpc_addr.into(),
            version: config.version.clone(),
            region: config.region.clone(),
            zone: config.zone.clone(),
            labels: config.labels.clone(),
        }
    }
}

pub struct UpstreamSync {
    identity: AgentIdentity,
    store: Arc<LocalStore>,
    /// `None` runs the agent standalone: pruning only.
    control: Option<ControlClient>,
    heartbeat_interval: Duration,
    local_max_age: Duration,
}

impl UpstreamSync {
    pub fn new(
        identity: AgentIdentity,
        store: Arc<LocalStore>,
        control: Option<ControlClient>,
        heartbeat_interval: Duration,
        local_max_age: Duration,
    ) -> Self {
        Self { identity, store, control, heartbeat_interval, local_max_age }
    }

    /// The full registration: every function with a live local instance.
    pub fn register_request(&self) -> AgentRegisterRequest {
        let functions = self
            .store
            .function_ids()
            .into_iter()
            .map(|id| AgentFunction { id, enabled: true })
            .collect();
        AgentRegisterRequest {
            agent_id: self.identity.agent_id.clone(),
            game_id: self.identity.game_id.clone(),
            env: self.identity.env.clone(),
            rpc_addr: self.identity.rpc_addr.clone(),
            version: self.identity.version.clone(),
            region: self.identity.region.clone(),
            zone: self.identity.zone.clone(),
            labels: self.identity.labels.clone(),
            functions,
        }
    }

    pub async fn register(&self) -> PitbossResult<()> {
        let Some(control) = &self.control else {
            return Ok(());
        };
        let request = self.register_request();
        let response = control.register(&request).await?;
        info!(
            agent_id = %request.agent_id,
            functions = request.functions.len(),
            expire_at = %response.expire_at,
            "registered upstream"
        );
        Ok(())
    }

    /// One heartbeat tick.
    pub async fn tick(&self) -> PitbossResult<()> {
        let pruned = self.store.prune(self.local_max_age);
        let Some(control) = &self.control else {
            return Ok(());
        };
        if pruned > 0 {
            return self.register().await;
        }
        let response = control.heartbeat(&self.identity.agent_id).await?;
        if !response.known {
            info!(agent_id = %self.identity.agent_id, "server lost this agent; registering again");
            return self.register().await;
        }
        debug!(agent_id = %self.identity.agent_id, "heartbeat acknowledged");
        Ok(())
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, mut changes: watch::Receiver<u64>, shutdown: CancellationToken) {
        if let Err(e) = self.register().await {
            warn!(error = %e, "initial upstream registration failed");
        }
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("upstream sync stopping");
                    break;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    changes.borrow_and_update();
                    if let Err(e) = self.register().await {
                        warn!(error = %e, "upstream registration failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "heartbeat tick failed");
                    }
                }
            }
        }
    }
}
