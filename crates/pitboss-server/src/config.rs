//! Server configuration, read from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pitboss_contracts::error::{PitbossError, PitbossResult};
use pitboss_core::IdempotencyCache;
use pitboss_registry::{HealthTracker, LbStrategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// HS256 secret for admin bearer tokens. Required.
    pub jwt_secret: String,
    /// When set, `/control/*` requires `Authorization: Bearer <token>`.
    pub control_token: Option<String>,
    /// The bundled policy is used when absent.
    pub policy_file: Option<PathBuf>,
    pub descriptors_dir: Option<PathBuf>,
    /// An in-memory chain is kept when absent.
    pub audit_path: Option<PathBuf>,
    pub audit_fsync: bool,
    /// SQLite URL, e.g. `sqlite:pitboss.db`. In-memory when absent.
    pub approvals_db: Option<String>,
    pub agent_ttl_secs: u64,
    /// Zero disables the reaper.
    pub reaper_interval_secs: u64,
    pub reaper_grace_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub idempotency_capacity: usize,
    pub call_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
    /// Balancer for `lb` routes: `round_robin`, `least_connections` or
    /// `weighted_round_robin`.
    pub lb_strategy: String,
    /// How long an agent is skipped after a transport failure. Zero
    /// disables health tracking.
    pub health_cooldown_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            jwt_secret: String::new(),
            control_token: None,
            policy_file: None,
            descriptors_dir: None,
            audit_path: None,
            audit_fsync: true,
            approvals_db: None,
            agent_ttl_secs: 60,
            reaper_interval_secs: 30,
            reaper_grace_secs: 300,
            idempotency_ttl_secs: IdempotencyCache::DEFAULT_TTL.as_secs(),
            idempotency_capacity: IdempotencyCache::DEFAULT_CAPACITY,
            call_timeout_ms: 3_000,
            connect_timeout_ms: 5_000,
            shutdown_grace_secs: 30,
            lb_strategy: "round_robin".to_string(),
            health_cooldown_secs: HealthTracker::DEFAULT_COOLDOWN.as_secs(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> PitbossResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| PitbossError::config(format!("failed to parse server config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> PitbossResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PitbossError::config(format!("failed to read server config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> PitbossResult<()> {
        if self.jwt_secret.is_empty() {
            return Err(PitbossError::config("jwt_secret is required"));
        }
        if self.agent_ttl_secs == 0 {
            return Err(PitbossError::config("agent_ttl_secs must be positive"));
        }
        if self.idempotency_capacity == 0 {
            return Err(PitbossError::config("idempotency_capacity must be positive"));
        }
        self.lb_strategy()?;
        Ok(())
    }

    pub fn agent_ttl(&self) -> Duration {
        Duration::from_secs(self.agent_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Option<Duration> {
        (self.reaper_interval_secs > 0).then(|| Duration::from_secs(self.reaper_interval_secs))
    }

    pub fn reaper_grace(&self) -> Duration {
        Duration::from_secs(self.reaper_grace_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn lb_strategy(&self) -> PitbossResult<LbStrategy> {
        LbStrategy::parse(&self.lb_strategy)
    }

    pub fn health_cooldown(&self) -> Duration {
        Duration::from_secs(self.health_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_takes_defaults() {
        let config = ServerConfig::from_toml_str(r#"jwt_secret = "s3cret""#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.agent_ttl(), Duration::from_secs(60));
        assert_eq!(config.idempotency_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.call_timeout(), Duration::from_secs(3));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert!(config.audit_fsync);
        assert!(config.approvals_db.is_none());
        assert_eq!(config.lb_strategy().unwrap(), LbStrategy::RoundRobin);
        assert_eq!(config.health_cooldown(), Duration::from_secs(10));
    }

    #[test]
    fn lb_strategy_is_checked_on_load() {
        let config = ServerConfig::from_toml_str(
            r#"
            jwt_secret = "s3cret"
            lb_strategy = "least_connections"
            health_cooldown_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.lb_strategy().unwrap(), LbStrategy::LeastConnections);
        assert!(config.health_cooldown().is_zero());

        let err = ServerConfig::from_toml_str(
            r#"
            jwt_secret = "s3cret"
            lb_strategy = "random"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("random"));
    }

    #[test]
    fn jwt_secret_is_required() {
        let err = ServerConfig::from_toml_str("").unwrap_err();
        assert!(err.to_string().contains("jwt_secret"));
    }

    #[test]
    fn reaper_can_be_disabled() {
        let config = ServerConfig::from_toml_str(
            r#"
            jwt_secret = "s3cret"
            reaper_interval_secs = 0
            approvals_db = "sqlite:pitboss.db"
            audit_path = "/var/lib/pitboss/audit.ndjson"
            "#,
        )
        .unwrap();
        assert!(config.reaper_interval().is_none());
        assert_eq!(config.approvals_db.as_deref(), Some("sqlite:pitboss.db"));
        assert_eq!(config.audit_path, Some(PathBuf::from("/var/lib/pitboss/audit.ndjson")));
    }
}
