//! Local instance configuration, read from TOML or built in code.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pitboss_contracts::error::{PitbossError, PitbossResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Unique per process; the agent keys its local store on it.
    pub service_id: String,
    pub version: String,
    pub listen_addr: String,
    /// Address the agent should call back on; the bound address when empty.
    pub advertise_addr: String,
    /// The co-located agent's local control surface.
    pub agent_addr: String,
    pub heartbeat_interval_secs: u64,
    /// Finished jobs stay streamable for this long.
    pub job_retention_secs: u64,
    /// Server base URL for the provider manifest upload; skipped when absent.
    pub server_url: Option<String>,
    pub control_token: Option<String>,
    pub shutdown_grace_secs: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            service_id: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            advertise_addr: String::new(),
            agent_addr: "127.0.0.1:19090".to_string(),
            heartbeat_interval_secs: 10,
            job_retention_secs: 600,
            server_url: None,
            control_token: None,
            shutdown_grace_secs: 10,
        }
    }
}

impl InstanceConfig {
    pub fn from_toml_str(s: &str) -> PitbossResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| PitbossError::config(format!("failed to parse instance config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> PitbossResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PitbossError::config(format!("failed to read instance config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> PitbossResult<()> {
        if self.service_id.is_empty() {
            return Err(PitbossError::config("service_id is required"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(PitbossError::config("heartbeat_interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let config = InstanceConfig::from_toml_str(
            r#"
            service_id = "moderation-1"
            agent_addr = "10.0.0.5:19090"
            heartbeat_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.service_id, "moderation-1");
        assert_eq!(config.agent_addr, "10.0.0.5:19090");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.listen_addr, "127.0.0.1:0");
        assert!(config.server_url.is_none());
    }

    #[test]
    fn service_id_is_required() {
        let err = InstanceConfig::from_toml_str("").unwrap_err();
        assert!(err.to_string().contains("service_id"));
    }
}
