//! Liveness records kept by the Agent and the Server.
//!
//! `LocalInstance` lives in an Agent's local store; `AgentSession` and
//! `ProviderCaps` live in the Server registry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A local process serving one or more functions behind an Agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalInstance {
    pub service_id: String,
    /// RPC address, `host:port` or a full `http://` URL.
    pub addr: String,
    #[serde(default)]
    pub version: String,
    pub last_seen: DateTime<Utc>,
}

/// Per-function switch reported by an Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionState {
    pub enabled: bool,
}

/// An Agent as the Server sees it.
///
/// `labels`, `functions`, and `expire_at` are optional so the same type can
/// carry a partial re-registration: `None` means "keep what is stored".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub agent_id: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub env: String,
    pub rpc_addr: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<HashMap<String, FunctionState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    pub fn new(agent_id: impl Into<String>, rpc_addr: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            game_id: String::new(),
            env: String::new(),
            rpc_addr: rpc_addr.into(),
            version: String::new(),
            region: String::new(),
            zone: String::new(),
            labels: None,
            functions: None,
            expire_at: None,
        }
    }

    /// True when `function_id` is present and enabled.
    pub fn serves(&self, function_id: &str) -> bool {
        self.functions
            .as_ref()
            .and_then(|f| f.get(function_id))
            .map(|s| s.enabled)
            .unwrap_or(false)
    }

    /// A session without an expiry has never been confirmed live.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expire_at, Some(at) if now <= at)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
    }

    /// Tenant filter: an empty filter value matches everything.
    pub fn matches_tenant(&self, game_id: Option<&str>, env: Option<&str>) -> bool {
        let game_ok = game_id.map_or(true, |g| g.is_empty() || self.game_id == g);
        let env_ok = env.map_or(true, |e| e.is_empty() || self.env == e);
        game_ok && env_ok
    }
}

/// SDK-uploaded manifest of the functions an ecosystem contributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCaps {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub sdk: String,
    /// Raw JSON manifest bytes.
    #[serde(with = "crate::codec::base64_bytes")]
    pub manifest: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn session_with(functions: &[(&str, bool)]) -> AgentSession {
        let mut s = AgentSession::new("a1", "127.0.0.1:19090");
        s.game_id = "g1".to_string();
        s.env = "dev".to_string();
        s.functions = Some(
            functions
                .iter()
                .map(|(id, enabled)| (id.to_string(), FunctionState { enabled: *enabled }))
                .collect(),
        );
        s
    }

    #[test]
    fn serves_only_enabled_functions() {
        let s = session_with(&[("player.ban", true), ("player.wipe", false)]);
        assert!(s.serves("player.ban"));
        assert!(!s.serves("player.wipe"));
        assert!(!s.serves("player.kick"));
    }

    #[test]
    fn liveness_requires_an_expiry() {
        let now = Utc::now();
        let mut s = session_with(&[]);
        assert!(!s.is_live_at(now));

        s.expire_at = Some(now + Duration::seconds(60));
        assert!(s.is_live_at(now));
        assert!(!s.is_live_at(now + Duration::seconds(61)));
    }

    #[test]
    fn tenant_filter() {
        let s = session_with(&[]);
        assert!(s.matches_tenant(None, None));
        assert!(s.matches_tenant(Some("g1"), Some("dev")));
        assert!(s.matches_tenant(Some(""), None));
        assert!(!s.matches_tenant(Some("g2"), None));
        assert!(!s.matches_tenant(Some("g1"), Some("prod")));
    }
}
