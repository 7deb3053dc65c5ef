//! Wire messages for the three pitboss surfaces.
//!
//! - Function RPC (`/rpc/*`): Server -> Agent and Agent -> local instance.
//! - Local control (`/local/*`): local instance -> Agent.
//! - Upstream control (`/control/*`): Agent -> Server.
//!
//! Byte fields travel as base64 strings inside JSON bodies.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PitbossError;
use crate::session::LocalInstance;

/// Metadata keys forwarded with every dispatch.
pub mod meta {
    pub const TRACE_ID: &str = "trace_id";
    pub const GAME_ID: &str = "game_id";
    pub const ENV: &str = "env";
    pub const ROUTE: &str = "route";
    pub const TARGET_SERVICE_ID: &str = "target_service_id";
    pub const HASH_KEY: &str = "hash_key";
    pub const TIMEOUT_MS: &str = "timeout_ms";
    pub const CALLER: &str = "caller";
}

// ── Function RPC ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub function_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    #[serde(default, with = "crate::codec::base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl InvokeRequest {
    pub fn new(function_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            function_id: function_id.into(),
            idempotency_key: String::new(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    #[serde(default, with = "crate::codec::base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStreamRequest {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelJobRequest {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelJobResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Progress,
    Log,
    Done,
    Error,
    /// The hop below went away before a terminal frame arrived.
    UpstreamClosed,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Progress => "progress",
            FrameKind::Log => "log",
            FrameKind::Done => "done",
            FrameKind::Error => "error",
            FrameKind::UpstreamClosed => "upstream_closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FrameKind::Done | FrameKind::Error | FrameKind::UpstreamClosed)
    }
}

/// One frame of a job stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Percent complete, 0..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, with = "crate::codec::base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    /// Error kind code on `error` frames, and on `upstream_closed` frames
    /// caused by a failed hop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl JobFrame {
    fn bare(kind: FrameKind) -> Self {
        Self { kind, message: String::new(), progress: None, payload: Vec::new(), code: None }
    }

    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        Self { progress: Some(percent.min(100)), message: message.into(), ..Self::bare(FrameKind::Progress) }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::bare(FrameKind::Log) }
    }

    pub fn done(payload: Vec<u8>) -> Self {
        Self { payload, progress: Some(100), ..Self::bare(FrameKind::Done) }
    }

    pub fn error(err: &PitbossError) -> Self {
        Self {
            message: err.message(),
            code: Some(err.code().to_string()),
            ..Self::bare(FrameKind::Error)
        }
    }

    pub fn upstream_closed(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::bare(FrameKind::UpstreamClosed) }
    }

    /// `upstream_closed` carrying the kind of the failure that ended the hop.
    pub fn upstream_failed(err: &PitbossError) -> Self {
        Self { code: Some(err.code().to_string()), ..Self::upstream_closed(err.message()) }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Opaque job handle `<agent_id>:<job_id>` returned by the Server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub agent_id: String,
    pub job_id: String,
}

impl JobHandle {
    pub fn new(agent_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self { agent_id: agent_id.into(), job_id: job_id.into() }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.agent_id, self.job_id)
    }
}

impl FromStr for JobHandle {
    type Err = PitbossError;

    /// Splits at the first `:`; agent ids never contain one, job ids may.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((agent, job)) if !agent.is_empty() && !job.is_empty() => Ok(Self::new(agent, job)),
            _ => Err(PitbossError::invalid("handle", format!("malformed job handle '{s}'"))),
        }
    }
}

// ── Local control ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFunction {
    pub id: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterLocalRequest {
    pub service_id: String,
    #[serde(default)]
    pub version: String,
    pub rpc_addr: String,
    pub functions: Vec<LocalFunction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterLocalResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHeartbeatRequest {
    pub service_id: String,
}

/// `known` is false when no instance carries the service id; the instance
/// should register again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHeartbeatResponse {
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFunctionInstances {
    pub id: String,
    pub instances: Vec<LocalInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListLocalResponse {
    pub functions: Vec<LocalFunctionInstances>,
}

// ── Upstream control ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFunction {
    pub id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegisterRequest {
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
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub functions: Vec<AgentFunction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegisterResponse {
    pub expire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHeartbeatRequest {
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHeartbeatResponse {
    /// False when the Server has no session for the agent; the agent should
    /// re-register.
    pub known: bool,
}

/// Provider caps upload; the manifest is any JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapsRequest {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub sdk: String,
    #[serde(default)]
    pub manifest: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapsResponse {
    /// False when the upload was ignored (empty id or manifest).
    pub updated: bool,
}
