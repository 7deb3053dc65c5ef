//! Per-agent call accounting used by routing.
//!
//! `CallStats` counts in-flight and finished calls per agent; the
//! least-connections balancer reads it. `HealthTracker` benches an agent for
//! a cooldown after a transport failure, so retries and the next calls go
//! to its neighbours instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use pitboss_contracts::session::AgentSession;

// ── Call statistics ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub active: u64,
    pub total: u64,
    pub failed: u64,
}

#[derive(Default)]
pub struct CallStats {
    inner: Mutex<HashMap<String, AgentStats>>,
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a call as in flight until the returned guard is dropped.
    pub fn begin(self: &Arc<Self>, agent_id: &str) -> InFlight {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = inner.entry(agent_id.to_string()).or_default();
        stats.active += 1;
        stats.total += 1;
        InFlight { stats: Arc::clone(self), agent_id: agent_id.to_string(), failed: false }
    }

    pub fn get(&self, agent_id: &str) -> AgentStats {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn active(&self, agent_id: &str) -> u64 {
        self.get(agent_id).active
    }

    fn finish(&self, agent_id: &str, failed: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stats) = inner.get_mut(agent_id) {
            stats.active = stats.active.saturating_sub(1);
            if failed {
                stats.failed += 1;
            }
        }
    }
}

/// One call in flight to one agent.
pub struct InFlight {
    stats: Arc<CallStats>,
    agent_id: String,
    failed: bool,
}

impl InFlight {
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.stats.finish(&self.agent_id, self.failed);
    }
}

// ── Health ───────────────────────────────────────────────────────────────────

pub struct HealthTracker {
    cooldown: Duration,
    benched: Mutex<HashMap<String, Instant>>,
}

impl HealthTracker {
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, benched: Mutex::new(HashMap::new()) }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn record_failure(&self, agent_id: &str) {
        self.record_failure_at(agent_id, Instant::now())
    }

    pub fn record_failure_at(&self, agent_id: &str, now: Instant) {
        if self.cooldown.is_zero() {
            return;
        }
        warn!(agent_id, cooldown_ms = self.cooldown.as_millis() as u64, "agent benched after a transport failure");
        self.benched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), now + self.cooldown);
    }

    pub fn record_success(&self, agent_id: &str) {
        let mut benched = self.benched.lock().unwrap_or_else(PoisonError::into_inner);
        if benched.remove(agent_id).is_some() {
            debug!(agent_id, "agent answered; back in rotation");
        }
    }

    pub fn is_healthy(&self, agent_id: &str) -> bool {
        self.is_healthy_at(agent_id, Instant::now())
    }

    pub fn is_healthy_at(&self, agent_id: &str, now: Instant) -> bool {
        let benched = self.benched.lock().unwrap_or_else(PoisonError::into_inner);
        benched.get(agent_id).map_or(true, |until| now >= *until)
    }

    /// The candidates not benched. When every candidate is benched all of
    /// them are returned, so a call is still attempted.
    pub fn filter(&self, candidates: Vec<Arc<AgentSession>>) -> Vec<Arc<AgentSession>> {
        self.filter_at(candidates, Instant::now())
    }

    pub fn filter_at(&self, candidates: Vec<Arc<AgentSession>>, now: Instant) -> Vec<Arc<AgentSession>> {
        let healthy: Vec<_> = candidates
            .iter()
            .filter(|a| self.is_healthy_at(&a.agent_id, now))
            .cloned()
            .collect();
        if healthy.is_empty() {
            candidates
        } else {
            healthy
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents(ids: &[&str]) -> Vec<Arc<AgentSession>> {
        ids.iter()
            .map(|id| Arc::new(AgentSession::new(*id, format!("{id}.internal:19090"))))
            .collect()
    }

    fn ids(list: &[Arc<AgentSession>]) -> Vec<&str> {
        list.iter().map(|a| a.agent_id.as_str()).collect()
    }

    #[test]
    fn in_flight_guard_counts_and_releases() {
        let stats = Arc::new(CallStats::new());
        let first = stats.begin("a1");
        let mut second = stats.begin("a1");
        assert_eq!(stats.active("a1"), 2);

        second.fail();
        drop(second);
        drop(first);
        assert_eq!(stats.get("a1"), AgentStats { active: 0, total: 2, failed: 1 });
        assert_eq!(stats.get("a9"), AgentStats::default());
    }

    #[test]
    fn failed_agent_sits_out_its_cooldown() {
        let health = HealthTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        health.record_failure_at("a1", t0);

        assert!(!health.is_healthy_at("a1", t0 + Duration::from_secs(5)));
        assert!(health.is_healthy_at("a1", t0 + Duration::from_secs(10)));
        assert!(health.is_healthy_at("a2", t0));

        let kept = health.filter_at(agents(&["a1", "a2"]), t0 + Duration::from_secs(1));
        assert_eq!(ids(&kept), vec!["a2"]);
    }

    #[test]
    fn success_clears_the_bench() {
        let health = HealthTracker::default();
        health.record_failure("a1");
        assert!(!health.is_healthy("a1"));
        health.record_success("a1");
        assert!(health.is_healthy("a1"));
    }

    #[test]
    fn all_benched_falls_back_to_every_candidate() {
        let health = HealthTracker::default();
        health.record_failure("a1");
        health.record_failure("a2");
        assert_eq!(ids(&health.filter(agents(&["a1", "a2"]))), vec!["a1", "a2"]);
    }

    #[test]
    fn zero_cooldown_never_benches() {
        let health = HealthTracker::new(Duration::ZERO);
        health.record_failure("a1");
        assert!(health.is_healthy("a1"));
    }
}
