//! The Server's agent table and provider capability catalog.
//!
//! One `RwLock` guards everything. Sessions are stored as `Arc`s and
//! replaced wholesale on every write, so a listing hands out cheap shared
//! snapshots that later writes never mutate.
//!
//! Expiry is lazy: nothing is removed on a timer, readers filter by `now`.
//! `reap_expired` exists for memory reclamation only.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use pitboss_contracts::session::{AgentSession, ProviderCaps};

/// Heartbeat extension applied by the control surface.
pub const DEFAULT_AGENT_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, Arc<AgentSession>>,
    provider_caps: HashMap<String, ProviderCaps>,
}

/// Authoritative index of agents across all tenants.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Agents ───────────────────────────────────────────────────────────────

    /// Insert or merge a session by `agent_id`.
    ///
    /// Scalars are replaced. `labels` and `functions` are replaced only when
    /// the update carries them. A missing `expire_at` keeps the stored one.
    pub fn upsert_agent(&self, update: AgentSession) {
        let mut state = self.write();
        let merged = match state.agents.get(&update.agent_id) {
            Some(existing) => {
                let mut merged = (**existing).clone();
                merged.game_id = update.game_id;
                merged.env = update.env;
                merged.rpc_addr = update.rpc_addr;
                merged.version = update.version;
                merged.region = update.region;
                merged.zone = update.zone;
                if update.labels.is_some() {
                    merged.labels = update.labels;
                }
                if update.functions.is_some() {
                    merged.functions = update.functions;
                }
                if update.expire_at.is_some() {
                    merged.expire_at = update.expire_at;
                }
                merged
            }
            None => update,
        };

        debug!(
            agent_id = %merged.agent_id,
            game_id = %merged.game_id,
            env = %merged.env,
            functions = merged.functions.as_ref().map_or(0, |f| f.len()),
            "agent upserted"
        );
        state.agents.insert(merged.agent_id.clone(), Arc::new(merged));
    }

    /// Set `expire_at = now + ttl`. Returns false, and changes nothing, when
    /// the agent is unknown.
    pub fn extend_expiry(&self, agent_id: &str, ttl: Duration) -> bool {
        self.extend_expiry_at(agent_id, ttl, Utc::now())
    }

    pub fn extend_expiry_at(&self, agent_id: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        let mut state = self.write();
        let Some(existing) = state.agents.get(agent_id) else {
            return false;
        };
        let mut refreshed = (**existing).clone();
        refreshed.expire_at = Some(now + chrono_ttl(ttl));
        state.agents.insert(agent_id.to_string(), Arc::new(refreshed));
        true
    }

    /// Live agents serving `function_id` within the optional tenant filter,
    /// ordered by `agent_id` so one call sees a stable candidate order.
    pub fn list_agents_for(
        &self,
        function_id: &str,
        game_id: Option<&str>,
        env: Option<&str>,
    ) -> Vec<Arc<AgentSession>> {
        self.list_agents_for_at(function_id, game_id, env, Utc::now())
    }

    pub fn list_agents_for_at(
        &self,
        function_id: &str,
        game_id: Option<&str>,
        env: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<Arc<AgentSession>> {
        let state = self.read();
        let mut out: Vec<Arc<AgentSession>> = state
            .agents
            .values()
            .filter(|s| s.serves(function_id))
            .filter(|s| s.matches_tenant(game_id, env))
            .filter(|s| s.is_live_at(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// A live agent by id.
    pub fn get_agent(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.get_agent_at(agent_id, Utc::now())
    }

    pub fn get_agent_at(&self, agent_id: &str, now: DateTime<Utc>) -> Option<Arc<AgentSession>> {
        self.read().agents.get(agent_id).filter(|s| s.is_live_at(now)).cloned()
    }

    /// Every stored session, expired ones included, ordered by `agent_id`.
    pub fn list_agents(&self) -> Vec<Arc<AgentSession>> {
        let mut out: Vec<_> = self.read().agents.values().cloned().collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Drop sessions that expired more than `grace` ago. Returns how many
    /// were removed.
    pub fn reap_expired(&self, grace: Duration) -> usize {
        self.reap_expired_at(grace, Utc::now())
    }

    pub fn reap_expired_at(&self, grace: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono_ttl(grace);
        let mut state = self.write();
        let before = state.agents.len();
        state
            .agents
            .retain(|_, s| matches!(s.expire_at, Some(at) if at >= cutoff));
        let removed = before - state.agents.len();
        if removed > 0 {
            info!(removed, "reaped expired agent sessions");
        }
        removed
    }

    // ── Provider caps ────────────────────────────────────────────────────────

    /// Latest-wins by `id`. Ignored when `id` or the manifest is empty.
    /// Returns whether the caps were stored.
    pub fn upsert_provider_caps(&self, mut caps: ProviderCaps) -> bool {
        if caps.id.is_empty() || caps.manifest.is_empty() {
            debug!(id = %caps.id, "ignoring provider caps without id or manifest");
            return false;
        }
        caps.updated_at = Utc::now();
        info!(id = %caps.id, version = %caps.version, lang = %caps.lang, "provider caps stored");
        self.write().provider_caps.insert(caps.id.clone(), caps);
        true
    }

    /// Snapshot copy ordered by `id`.
    pub fn list_provider_caps(&self) -> Vec<ProviderCaps> {
        let mut out: Vec<_> = self.read().provider_caps.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}
