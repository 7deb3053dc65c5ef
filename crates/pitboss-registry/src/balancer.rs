//! Agent selection strategies applied on top of a registry listing.
//!
//! Every strategy returns an index into the candidate slice rather than the
//! session itself, so the dispatcher can fall back to a neighbour when the
//! first pick fails at the transport layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use pitboss_contracts::{
    descriptor::Route,
    error::{PitbossError, PitbossResult},
    session::AgentSession,
};

use crate::health::{CallStats, HealthTracker};

/// Label an agent may carry to be addressable by `target_service_id`.
pub const SERVICE_ID_LABEL: &str = "service_id";

/// Label holding an agent's positive integer weight for weighted round robin.
pub const WEIGHT_LABEL: &str = "weight";

/// A stateless or internally synchronized agent picker.
pub trait Balancer: Send + Sync {
    /// Pick one of `candidates`, or `None` when the slice is empty or no
    /// candidate qualifies.
    fn pick(&self, candidates: &[Arc<AgentSession>], key: Option<&str>) -> Option<usize>;

    fn name(&self) -> &'static str;
}

// ── Round robin ──────────────────────────────────────────────────────────────

/// Rotates over the candidate list with a shared atomic counter.
#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn pick(&self, candidates: &[Arc<AgentSession>], _key: Option<&str>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(n % candidates.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

// ── Least connections ────────────────────────────────────────────────────────

/// Picks the candidate with the fewest calls in flight; ties go to the one
/// that has served fewer calls overall, then to the earlier candidate.
pub struct LeastConnections {
    stats: Arc<CallStats>,
}

impl LeastConnections {
    pub fn new(stats: Arc<CallStats>) -> Self {
        Self { stats }
    }
}

impl Balancer for LeastConnections {
    fn pick(&self, candidates: &[Arc<AgentSession>], _key: Option<&str>) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(idx, a)| {
                let stats = self.stats.get(&a.agent_id);
                (stats.active, stats.total, *idx)
            })
            .map(|(idx, _)| idx)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

// ── Weighted round robin ─────────────────────────────────────────────────────

/// Smooth weighted round robin over the `weight` label (default 1): over
/// any window of `sum(weights)` picks each agent is chosen `weight` times,
/// interleaved rather than in bursts.
#[derive(Default)]
pub struct WeightedRoundRobin {
    current: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight_of(agent: &AgentSession) -> i64 {
        agent
            .label(WEIGHT_LABEL)
            .and_then(|w| w.trim().parse::<u32>().ok())
            .filter(|w| *w > 0)
            .map_or(1, i64::from)
    }
}

impl Balancer for WeightedRoundRobin {
    fn pick(&self, candidates: &[Arc<AgentSession>], _key: Option<&str>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.retain(|id, _| candidates.iter().any(|a| &a.agent_id == id));

        let mut total = 0;
        let mut best: Option<(usize, i64)> = None;
        for (idx, agent) in candidates.iter().enumerate() {
            let weight = Self::weight_of(agent);
            total += weight;
            let score = current.entry(agent.agent_id.clone()).or_insert(0);
            *score += weight;
            if best.map_or(true, |(_, top)| *score > top) {
                best = Some((idx, *score));
            }
        }
        let (idx, _) = best?;
        if let Some(score) = current.get_mut(&candidates[idx].agent_id) {
            *score -= total;
        }
        Some(idx)
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

// ── Consistent hash ──────────────────────────────────────────────────────────

type Ring = Arc<Vec<(u32, usize)>>;

/// FNV-1a ring with virtual nodes. The same key lands on the same agent for
/// as long as the candidate set is unchanged, and moves for only ~1/n of
/// keys when an agent joins or leaves.
///
/// The ring is rebuilt only when the candidate ids change.
pub struct ConsistentHash {
    replicas: usize,
    cached: Mutex<Option<(Vec<String>, Ring)>>,
}

impl ConsistentHash {
    pub const DEFAULT_REPLICAS: usize = 150;

    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: if replicas == 0 { Self::DEFAULT_REPLICAS } else { replicas },
            cached: Mutex::new(None),
        }
    }

    fn ring(&self, candidates: &[Arc<AgentSession>]) -> Ring {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((ids, ring)) = cached.as_ref() {
            if ids.len() == candidates.len() && ids.iter().zip(candidates).all(|(id, a)| *id == a.agent_id) {
                return Arc::clone(ring);
            }
        }

        let mut ring = Vec::with_capacity(candidates.len() * self.replicas);
        for (idx, agent) in candidates.iter().enumerate() {
            for replica in 0..self.replicas {
                ring.push((fnv1a32(format!("{}#{}", agent.agent_id, replica).as_bytes()), idx));
            }
        }
        ring.sort_unstable();
        let ring = Arc::new(ring);
        let ids = candidates.iter().map(|a| a.agent_id.clone()).collect();
        *cached = Some((ids, Arc::clone(&ring)));
        ring
    }

    #[cfg(test)]
    fn cached_ring(&self) -> Option<Ring> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, ring)| Arc::clone(ring))
    }
}

impl Default for ConsistentHash {
    fn default() -> Self {
        Self::new(Self::DEFAULT_REPLICAS)
    }
}

impl Balancer for ConsistentHash {
    /// An empty key has no affinity and falls back to the first candidate.
    fn pick(&self, candidates: &[Arc<AgentSession>], key: Option<&str>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let key = match key {
            Some(k) if !k.is_empty() => k,
            _ => return Some(0),
        };

        let ring = self.ring(candidates);
        let h = fnv1a32(key.as_bytes());
        let pos = ring.partition_point(|(node, _)| *node < h);
        let (_, idx) = ring[if pos == ring.len() { 0 } else { pos }];
        Some(idx)
    }

    fn name(&self) -> &'static str {
        "consistent_hash"
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET, |h, b| (h ^ u32::from(*b)).wrapping_mul(PRIME))
}

// ── Targeted ─────────────────────────────────────────────────────────────────

/// Picks the agent whose id, or `service_id` label, equals the key.
#[derive(Default)]
pub struct Targeted;

impl Balancer for Targeted {
    fn pick(&self, candidates: &[Arc<AgentSession>], key: Option<&str>) -> Option<usize> {
        let target = key.filter(|k| !k.is_empty())?;
        candidates
            .iter()
            .position(|a| a.agent_id == target || a.label(SERVICE_ID_LABEL) == Some(target))
    }

    fn name(&self) -> &'static str {
        "targeted"
    }
}

// ── Strategy table ───────────────────────────────────────────────────────────

/// The balancer behind `Route::Lb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbStrategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
}

impl LbStrategy {
    pub fn parse(s: &str) -> PitbossResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "round_robin" | "rr" => Ok(LbStrategy::RoundRobin),
            "least_connections" | "least_conn" => Ok(LbStrategy::LeastConnections),
            "weighted_round_robin" | "weighted" => Ok(LbStrategy::WeightedRoundRobin),
            other => Err(PitbossError::config(format!("unknown load balancing strategy '{other}'"))),
        }
    }
}

/// One balancer per `Route`, shared for the life of the process so the
/// round-robin counter keeps rotating across calls, plus the call stats and
/// health tracker every route consults.
pub struct Balancers {
    lb: Box<dyn Balancer>,
    service_id: Box<dyn Balancer>,
    hash_key: Box<dyn Balancer>,
    stats: Arc<CallStats>,
    health: Arc<HealthTracker>,
}

impl Balancers {
    pub fn new(
        lb: Box<dyn Balancer>,
        service_id: Box<dyn Balancer>,
        hash_key: Box<dyn Balancer>,
    ) -> Self {
        Self {
            lb,
            service_id,
            hash_key,
            stats: Arc::new(CallStats::new()),
            health: Arc::new(HealthTracker::default()),
        }
    }

    pub fn with_strategy(strategy: LbStrategy, health: HealthTracker) -> Self {
        let stats = Arc::new(CallStats::new());
        let lb: Box<dyn Balancer> = match strategy {
            LbStrategy::RoundRobin => Box::new(RoundRobin::new()),
            LbStrategy::LeastConnections => Box::new(LeastConnections::new(Arc::clone(&stats))),
            LbStrategy::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        };
        Self {
            lb,
            service_id: Box::new(Targeted),
            hash_key: Box::new(ConsistentHash::default()),
            stats,
            health: Arc::new(health),
        }
    }

    pub fn for_route(&self, route: Route) -> &dyn Balancer {
        match route {
            Route::Lb => self.lb.as_ref(),
            Route::ServiceId => self.service_id.as_ref(),
            Route::HashKey => self.hash_key.as_ref(),
        }
    }

    pub fn stats(&self) -> &Arc<CallStats> {
        &self.stats
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }
}

impl Default for Balancers {
    fn default() -> Self {
        Self::with_strategy(LbStrategy::RoundRobin, HealthTracker::default())
    }
}
