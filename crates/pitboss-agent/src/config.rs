//! Agent configuration, read from TOML. Every field has a default, so an
//! empty document is a valid standalone agent on `127.0.0.1:19090`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pitboss_contracts::error::{PitbossError, PitbossResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: String,
    pub game_id: String,
    pub env: String,
    pub listen_addr: String,
    /// Address the Server dials; the bound address when empty.
    pub advertise_addr: String,
    /// Upstream Server. Without one the agent serves its host only.
    pub server_url: Option<String>,
    pub control_token: Option<String>,
    pub version: String,
    pub region: String,
    pub zone: String,
    pub labels: HashMap<String, String>,
    pub heartbeat_interval_secs: u64,
    /// Local instances silent for longer are pruned.
    pub local_max_age_secs: u64,
    pub call_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            game_id: String::new(),
            env: String::new(),
            listen_addr: "127.0.0.1:19090".to_string(),
            advertise_addr: String::new(),
            server_url: None,
            control_token: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            region: String::new(),
            zone: String::new(),
            labels: HashMap::new(),
            heartbeat_interval_secs: 30,
            local_max_age_secs: 60,
            call_timeout_ms: 3_000,
            connect_timeout_ms: 5_000,
            shutdown_grace_secs: 30,
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(s: &str) -> PitbossResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| PitbossError::config(format!("failed to parse agent config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> PitbossResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PitbossError::config(format!("failed to read agent config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> PitbossResult<()> {
        if self.server_url.is_some() && self.agent_id.trim().is_empty() {
            return Err(PitbossError::config("agent_id is required when server_url is set"));
        }
        if self.agent_id.contains(':') {
            return Err(PitbossError::config(format!("agent_id '{}' must not contain ':'", self.agent_id)));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(PitbossError::config("heartbeat_interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn local_max_age(&self) -> Duration {
        Duration::from_secs(self.local_max_age_secs)
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
}
