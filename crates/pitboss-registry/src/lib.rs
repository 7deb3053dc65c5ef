//! # pitboss-registry
//!
//! The Server's view of the fleet: which agents are live, for which
//! `(game_id, env)` tenant, serving which functions, plus the provider
//! capability manifests uploaded by SDKs.
//!
//! Routing strategies live next to the registry because they only ever run
//! over a registry listing, and so does the per-agent call accounting
//! they read.
//!
//! ```rust,ignore
//! use pitboss_registry::{Registry, Balancers};
//!
//! let candidates = registry.list_agents_for("player.ban", Some("g1"), Some("dev"));
//! let idx = balancers.for_route(route).pick(&candidates, hash_key);
//! ```

pub mod balancer;
pub mod health;
pub mod registry;

pub use balancer::{
    Balancer, Balancers, ConsistentHash, LbStrategy, LeastConnections, RoundRobin, Targeted,
    WeightedRoundRobin,
};
pub use health::{AgentStats, CallStats, HealthTracker, InFlight};
pub use registry::{Registry, DEFAULT_AGENT_TTL};
