//! Function descriptors: the identity and dispatch semantics of an exposed
//! capability.
//!
//! Descriptors are loaded by the Server from JSON documents. Every field
//! beyond `id` has a default so that a minimal document such as
//! `{"id": "player.ban"}` is a valid, low-risk, load-balanced query.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PitbossError, PitbossResult};

/// Identity and semantics of one function under one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// Stable dotted identifier, e.g. `player.ban`.
    pub id: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub transport: Transport,

    #[serde(default)]
    pub semantics: Semantics,

    #[serde(default)]
    pub auth: AuthSpec,

    #[serde(default)]
    pub placement: Placement,

    #[serde(default)]
    pub risk: Risk,

    /// JSON Schema the payload must satisfy. Absent means unchecked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(default)]
    pub ui: UiHints,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl FunctionDescriptor {
    /// A descriptor with every field defaulted.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            category: String::new(),
            transport: Transport::default(),
            semantics: Semantics::default(),
            auth: AuthSpec::default(),
            placement: Placement::default(),
            risk: Risk::default(),
            params: None,
            ui: UiHints::default(),
        }
    }

    /// The permission code the explicit RBAC check requires.
    pub fn permission(&self) -> String {
        match &self.auth.permission {
            Some(p) if !p.is_empty() => p.clone(),
            _ => self.id.clone(),
        }
    }

    /// Parsed `semantics.timeout`, if any.
    pub fn timeout(&self) -> PitbossResult<Option<Duration>> {
        self.semantics
            .timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map_err(|e| e.with_context(format!("descriptor '{}'", self.id)))
    }

    /// Check the invariants a descriptor must hold before it is registered.
    pub fn validate(&self) -> PitbossResult<()> {
        if self.id.trim().is_empty() {
            return Err(PitbossError::invalid("id", "descriptor id must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(PitbossError::invalid("version", "descriptor version must not be empty"));
        }
        if let Transport::Proto { request_fqn, .. } = &self.transport {
            if request_fqn.is_empty() {
                return Err(PitbossError::invalid(
                    "transport.request_fqn",
                    "proto transport requires a request message name",
                ));
            }
        }
        self.timeout()?;
        Ok(())
    }
}

/// Payload encoding between Server, Agent, and local instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Json,
    Proto {
        request_fqn: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_fqn: Option<String>,
        #[serde(default)]
        encoding: ProtoEncoding,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtoEncoding {
    #[default]
    Binary,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Semantics {
    #[serde(default)]
    pub mode: Mode,

    /// When true every call must carry an idempotency key.
    #[serde(default)]
    pub idempotency_key: bool,

    /// Per-call timeout such as `"3s"`, `"500ms"`, or `"2m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default)]
    pub route: Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Query,
    Command,
}

/// Agent selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    #[default]
    Lb,
    #[serde(alias = "targeted")]
    ServiceId,
    #[serde(alias = "hash")]
    HashKey,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Lb => "lb",
            Route::ServiceId => "service_id",
            Route::HashKey => "hash_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lb" => Some(Route::Lb),
            "service_id" | "targeted" => Some(Route::ServiceId),
            "hash_key" | "hash" => Some(Route::HashKey),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthSpec {
    /// Permission code checked instead of the function id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,

    /// Calls park as a pending approval until a second operator approves.
    #[serde(default)]
    pub two_person_rule: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    #[default]
    Agent,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UiHints {
    /// Payload field paths masked before audit hashing and previews.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensitive: Vec<String>,
}

/// Parse `"250ms"`, `"3s"`, `"2m"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> PitbossResult<Duration> {
    let s = s.trim();
    let bad = || PitbossError::invalid("semantics.timeout", format!("unrecognised duration '{s}'"));

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = digits.parse().map_err(|_| bad())?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => n
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| PitbossError::invalid("semantics.timeout", format!("duration '{s}' is out of range"))),
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_takes_defaults() {
        let d: FunctionDescriptor = serde_json::from_str(r#"{"id":"player.ban"}"#).unwrap();
        assert_eq!(d.version, "1.0.0");
        assert_eq!(d.transport, Transport::Json);
        assert_eq!(d.semantics.route, Route::Lb);
        assert_eq!(d.placement, Placement::Agent);
        assert_eq!(d.risk, Risk::Low);
        assert!(!d.auth.two_person_rule);
        assert_eq!(d.permission(), "player.ban");
    }

    #[test]
    fn full_document_parses() {
        let d: FunctionDescriptor = serde_json::from_str(
            r#"{
                "id": "player.wipe",
                "version": "2.1.0",
                "category": "player",
                "transport": {"kind": "proto", "request_fqn": "game.v1.WipeRequest", "encoding": "json"},
                "semantics": {"mode": "command", "idempotency_key": true, "timeout": "10s", "route": "hash_key"},
                "auth": {"permission": "player:wipe", "two_person_rule": true},
                "placement": "agent",
                "risk": "high",
                "ui": {"sensitive": ["reason", "player.email"]}
            }"#,
        )
        .unwrap();

        assert_eq!(d.semantics.mode, Mode::Command);
        assert_eq!(d.semantics.route, Route::HashKey);
        assert_eq!(d.timeout().unwrap(), Some(Duration::from_secs(10)));
        assert_eq!(d.permission(), "player:wipe");
        assert_eq!(d.ui.sensitive, vec!["reason", "player.email"]);
        match d.transport {
            Transport::Proto { request_fqn, encoding, .. } => {
                assert_eq!(request_fqn, "game.v1.WipeRequest");
                assert_eq!(encoding, ProtoEncoding::Json);
            }
            other => panic!("expected proto transport, got {:?}", other),
        }
    }

    #[test]
    fn legacy_route_names_are_accepted() {
        let d: FunctionDescriptor =
            serde_json::from_str(r#"{"id":"x","semantics":{"route":"targeted"}}"#).unwrap();
        assert_eq!(d.semantics.route, Route::ServiceId);
        assert_eq!(Route::parse("hash"), Some(Route::HashKey));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5h").is_err());
        match parse_duration(&format!("{}m", u64::MAX)) {
            Err(PitbossError::InvalidArgument { field, .. }) => assert_eq!(field, "semantics.timeout"),
            other => panic!("expected an out-of-range timeout, got {:?}", other),
        }
    }

    #[test]
    fn validate_rejects_bad_timeout() {
        let mut d = FunctionDescriptor::new("player.ban");
        d.semantics.timeout = Some("fast".to_string());
        match d.validate() {
            Err(PitbossError::InvalidArgument { field, .. }) => assert_eq!(field, "semantics.timeout"),
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }
}
