//! Seam traits for the pitboss dispatch pipeline.
//!
//! The dispatcher depends only on these traits, never on a concrete policy,
//! store, sink, or network client:
//!
//! - `PermissionPolicy` : RBAC, both the explicit permission check and the
//!   HTTP method/path layer
//! - `ScopeResolver`    : the caller's `(game, env)` scope and game name lookup
//! - `PayloadVerifier`  : descriptor-driven payload validation
//! - `AuditSink`        : the tamper-evident append-only record
//! - `ApprovalStore`    : durable two-person-rule state machine
//! - `AgentTransport`   : the function RPC hop to an agent
//!
//! Synchronous traits must not perform network I/O. `AuditSink` may touch
//! disk; the dispatcher calls it from a blocking task.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use pitboss_contracts::{
    approval::{Approval, ApprovalFilter, PageRequest},
    audit::AuditEntry,
    descriptor::FunctionDescriptor,
    error::{CallError, PitbossResult},
    session::AgentSession,
    tenant::{Caller, TenantScope},
    verify::VerificationReport,
    wire::{CancelJobRequest, CancelJobResponse, InvokeRequest, InvokeResponse, JobFrame, StartJobResponse},
};

/// Frames as received from the next hop; an `Err` item means the hop broke.
pub type FrameStream = Pin<Box<dyn Stream<Item = PitbossResult<JobFrame>> + Send>>;

/// Frames as relayed to a caller: infallible, always ending with exactly one
/// terminal frame.
pub type JobFrames = Pin<Box<dyn Stream<Item = JobFrame> + Send>>;

/// Role-based access control.
///
/// Implementations are trusted and must be deterministic. Admin roles are
/// expected to short-circuit to `true` before any rule is consulted.
pub trait PermissionPolicy: Send + Sync {
    /// Explicit check with a permission code. When `game_id` is given,
    /// per-game grants (`game:<gid>:<perm>`, `game:<gid>:*`) also count.
    fn is_allowed(&self, caller: &Caller, permission: &str, game_id: Option<&str>) -> bool;

    /// The generic middleware check on HTTP method and path.
    fn is_route_allowed(&self, caller: &Caller, method: &str, path: &str) -> bool;
}

/// Tenant scope lookup.
pub trait ScopeResolver: Send + Sync {
    /// The `(game, env)` tuples the caller may touch.
    fn scope_for(&self, caller: &Caller) -> TenantScope;

    /// Resolve a game id or display name to the canonical id. `None` when
    /// the directory knows no such game.
    fn resolve_game(&self, id_or_name: &str) -> Option<String>;
}

/// Payload validation against a descriptor.
///
/// Return a failing report for bad payloads; reserve `Err` for failures of
/// the verifier itself, such as an uncompilable schema.
pub trait PayloadVerifier: Send + Sync {
    fn verify(&self, descriptor: &FunctionDescriptor, payload: &[u8]) -> PitbossResult<VerificationReport>;
}

/// The append-only audit record.
pub trait AuditSink: Send + Sync {
    /// Append one entry and return its `this_hash`.
    fn append(&self, entry: &AuditEntry) -> PitbossResult<String>;

    /// Push buffered records to durable storage.
    fn flush(&self) -> PitbossResult<()>;
}

/// Durable two-person-rule state machine.
///
/// `approve` and `reject` are compare-and-swap on `state == pending`: across
/// any interleaving of concurrent calls on one id, exactly one succeeds and
/// the rest fail with `NotPending`.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a new approval. The store stamps `created_at` and forces
    /// `state = pending`. A duplicate id is a `Conflict`.
    async fn create(&self, approval: Approval) -> PitbossResult<Approval>;

    async fn get(&self, id: &str) -> PitbossResult<Approval>;

    /// `pending -> approved`, clearing `reason`.
    async fn approve(&self, id: &str) -> PitbossResult<Approval>;

    /// `pending -> rejected`, storing `reason`.
    async fn reject(&self, id: &str, reason: &str) -> PitbossResult<Approval>;

    /// Matching approvals for one page plus the total match count.
    async fn list(&self, filter: &ApprovalFilter, page: PageRequest) -> PitbossResult<(Vec<Approval>, u64)>;
}

/// The function RPC hop from the Server to one agent.
///
/// `timeout` bounds the whole exchange; the connect phase has its own,
/// shorter bound inside the implementation.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentSession,
        request: InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, CallError>;

    async fn start_job(
        &self,
        agent: &AgentSession,
        request: InvokeRequest,
        timeout: Duration,
    ) -> Result<StartJobResponse, CallError>;

    /// Open the frame stream. Dropping the returned stream closes the
    /// connection to the agent.
    async fn stream_job(&self, agent: &AgentSession, job_id: &str) -> Result<FrameStream, CallError>;

    async fn cancel_job(
        &self,
        agent: &AgentSession,
        request: CancelJobRequest,
        timeout: Duration,
    ) -> Result<CancelJobResponse, CallError>;
}
