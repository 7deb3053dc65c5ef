//! The pitboss dispatcher: the Server's policy-bound call pipeline.
//!
//! Every admin call runs the same gate:
//!
//!   Resolve game → RBAC → Scope → Descriptor → Verify → Two-person rule
//!     → Idempotency → Route → Forward → Audit
//!
//! The forward step is structurally unreachable unless RBAC, scope and
//! payload verification have all passed. Two-person-rule calls stop at the
//! gate and park as a pending approval; `approve` later runs the stored call
//! from the idempotency step onwards on behalf of the original actor.
//!
//! Every dispatch, denied or not, leaves one audit entry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use pitboss_contracts::{
    approval::{Approval, ApprovalFilter, ApprovalMode, PageRequest},
    audit::{AuditEntry, OUTCOME_OK, OUTCOME_PENDING},
    descriptor::{FunctionDescriptor, Route},
    error::{CallError, ErrorKind, ForbiddenReason, PitbossError, PitbossResult},
    session::{AgentSession, ProviderCaps},
    tenant::Caller,
    wire::{meta, CancelJobRequest, InvokeRequest, JobHandle, ProviderCapsRequest},
};
use pitboss_registry::{Balancers, Registry};

use crate::catalog::FunctionCatalog;
use crate::idempotency::{Claim, IdempotencyCache, IdempotencyKey};
use crate::masking;
use crate::relay::relay_frames;
use crate::traits::{
    AgentTransport, ApprovalStore, AuditSink, JobFrames, PayloadVerifier, PermissionPolicy,
    ScopeResolver,
};

/// Permission codes for the non-function operations.
pub mod permissions {
    pub const JOBS_STREAM: &str = "jobs:stream";
    pub const JOBS_CANCEL: &str = "jobs:cancel";
    pub const APPROVALS_READ: &str = "approvals:read";
    pub const APPROVALS_APPROVE: &str = "approvals:approve";
    pub const APPROVALS_REJECT: &str = "approvals:reject";
    pub const REGISTRY_READ: &str = "registry:read";
    pub const PROVIDERS_READ: &str = "providers:read";
    pub const PROVIDERS_WRITE: &str = "providers:write";
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Call timeout when the descriptor declares none.
    pub default_timeout: Duration,
    /// Extra time the Server waits beyond the call timeout it hands the
    /// agent, so the agent's own deadline fires first and its error wins.
    pub transport_grace: Duration,
    pub cancel_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(3),
            transport_grace: Duration::from_secs(1),
            cancel_timeout: Duration::from_secs(5),
        }
    }
}

/// One admin call as it enters the pipeline.
#[derive(Debug, Clone)]
pub struct DispatchCall {
    pub caller: Caller,
    pub function_id: String,
    pub payload: Vec<u8>,
    /// Game id or display name; resolved to the id before any check.
    pub game: Option<String>,
    pub env: Option<String>,
    pub idempotency_key: Option<String>,
    /// Overrides the descriptor's route when set.
    pub route: Option<Route>,
    pub target_service_id: Option<String>,
    pub hash_key: Option<String>,
    pub trace_id: String,
    /// Caller-imposed deadline, relative to arrival.
    pub deadline: Option<Duration>,
}

impl DispatchCall {
    pub fn new(caller: Caller, function_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            caller,
            function_id: function_id.into(),
            payload,
            game: None,
            env: None,
            idempotency_key: None,
            route: None,
            target_service_id: None,
            hash_key: None,
            trace_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
        }
    }

    /// Rebuild the call an approval parked, on behalf of its requester.
    pub fn from_approval(approval: &Approval, trace_id: impl Into<String>) -> Self {
        fn opt(s: &str) -> Option<String> {
            (!s.is_empty()).then(|| s.to_string())
        }
        Self {
            caller: Caller { user: approval.actor.clone(), roles: Vec::new() },
            function_id: approval.function_id.clone(),
            payload: approval.payload.clone(),
            game: opt(&approval.game_id),
            env: opt(&approval.env),
            idempotency_key: opt(&approval.idempotency_key),
            route: approval.route,
            target_service_id: opt(&approval.target_service_id),
            hash_key: opt(&approval.hash_key),
            trace_id: trace_id.into(),
            deadline: None,
        }
    }

    pub fn game(&self) -> Option<&str> {
        non_empty(self.game.as_deref())
    }

    pub fn env(&self) -> Option<&str> {
        non_empty(self.env.as_deref())
    }
}

/// Either the call ran, or it parked behind the two-person rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched<T> {
    Done(T),
    Pending(Approval),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStarted {
    pub job_id: String,
    /// `<agent_id>:<job_id>`, opaque to clients.
    pub job_handle: String,
    pub agent_id: String,
}

/// The result of an executed call.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Payload(Vec<u8>),
    Job(JobStarted),
}

enum Admission {
    Proceed(Arc<FunctionDescriptor>),
    Parked(Approval),
}

struct RoutePlan {
    route: Route,
    attempts: Vec<Arc<AgentSession>>,
    /// Ask every candidate in turn, moving on when one has no provider.
    sweep: bool,
    /// The target named an agent directly, not a local instance.
    strip_target: bool,
}

enum Decision<'a> {
    Approve,
    Reject(&'a str),
}

/// Every collaborator the dispatcher is built from.
pub struct DispatcherParts {
    pub catalog: Arc<FunctionCatalog>,
    pub registry: Arc<Registry>,
    pub balancers: Balancers,
    pub idempotency: Arc<IdempotencyCache>,
    pub policy: Arc<dyn PermissionPolicy>,
    pub scopes: Arc<dyn ScopeResolver>,
    pub verifier: Arc<dyn PayloadVerifier>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub audit: Arc<dyn AuditSink>,
    pub transport: Arc<dyn AgentTransport>,
    pub options: DispatchOptions,
}

/// The central dispatcher. One per Server process, shared across requests.
pub struct Dispatcher {
    catalog: Arc<FunctionCatalog>,
    registry: Arc<Registry>,
    balancers: Balancers,
    idempotency: Arc<IdempotencyCache>,
    policy: Arc<dyn PermissionPolicy>,
    scopes: Arc<dyn ScopeResolver>,
    verifier: Arc<dyn PayloadVerifier>,
    approvals: Arc<dyn ApprovalStore>,
    audit: Arc<dyn AuditSink>,
    transport: Arc<dyn AgentTransport>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        Self {
            catalog: parts.catalog,
            registry: parts.registry,
            balancers: parts.balancers,
            idempotency: parts.idempotency,
            policy: parts.policy,
            scopes: parts.scopes,
            verifier: parts.verifier,
            approvals: parts.approvals,
            audit: parts.audit,
            transport: parts.transport,
            options: parts.options,
        }
    }

    pub fn catalog(&self) -> &Arc<FunctionCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The explicit permission check followed by the scope guard.
    pub fn authorize(
        &self,
        caller: &Caller,
        permission: &str,
        game_id: Option<&str>,
        env: Option<&str>,
    ) -> PitbossResult<()> {
        if !self.policy.is_allowed(caller, permission, game_id) {
            warn!(user = %caller.user, permission, game_id = ?game_id, "rbac denied");
            return Err(PitbossError::forbidden(
                ForbiddenReason::Rbac,
                format!("user '{}' lacks permission '{}'", caller.user, permission),
            ));
        }
        self.scopes.scope_for(caller).check(game_id, env).map_err(|e| {
            warn!(user = %caller.user, game_id = ?game_id, env = ?env, error = %e, "scope denied");
            e
        })
    }

    /// Resolve a game name to its id. Unknown names pass through unchanged
    /// and fail the scope check of any scoped caller.
    pub fn resolve_game(&self, game: &str) -> String {
        self.scopes.resolve_game(game).unwrap_or_else(|| game.to_string())
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Synchronous invoke. Returns the provider's bytes unchanged.
    pub async fn invoke(&self, mut call: DispatchCall) -> PitbossResult<Dispatched<Vec<u8>>> {
        self.resolve_call(&mut call);
        let result = async {
            match self.admit(&call, ApprovalMode::Invoke).await? {
                Admission::Parked(approval) => Ok(Dispatched::Pending(approval)),
                Admission::Proceed(descriptor) => {
                    match self.execute(&call, &descriptor, ApprovalMode::Invoke).await? {
                        Completion::Payload(bytes) => Ok(Dispatched::Done(bytes)),
                        Completion::Job(_) => Err(PitbossError::internal("invoke produced a job")),
                    }
                }
            }
        }
        .await;

        self.audit_dispatch(&call, ApprovalMode::Invoke, &result).await;
        result
    }

    /// Start a long-running job; the handle addresses the agent holding the
    /// job mapping.
    pub async fn start_job(&self, mut call: DispatchCall) -> PitbossResult<Dispatched<JobStarted>> {
        self.resolve_call(&mut call);
        let result = async {
            match self.admit(&call, ApprovalMode::StartJob).await? {
                Admission::Parked(approval) => Ok(Dispatched::Pending(approval)),
                Admission::Proceed(descriptor) => {
                    match self.execute(&call, &descriptor, ApprovalMode::StartJob).await? {
                        Completion::Job(job) => Ok(Dispatched::Done(job)),
                        Completion::Payload(_) => {
                            Err(PitbossError::internal("start_job produced an invoke payload"))
                        }
                    }
                }
            }
        }
        .await;

        self.audit_dispatch(&call, ApprovalMode::StartJob, &result).await;
        result
    }

    fn resolve_call(&self, call: &mut DispatchCall) {
        // ── Step 1: Resolve the game name to its id ──────────────────────────
        if let Some(game) = call.game().map(str::to_string) {
            let resolved = self.resolve_game(&game);
            if resolved != game {
                debug!(trace_id = %call.trace_id, game = %game, game_id = %resolved, "game name resolved");
            }
            call.game = Some(resolved);
        }
    }

    /// Steps 2 to 6: everything that decides whether the call may run.
    async fn admit(&self, call: &DispatchCall, mode: ApprovalMode) -> PitbossResult<Admission> {
        debug!(
            trace_id = %call.trace_id,
            user = %call.caller.user,
            function_id = %call.function_id,
            mode = mode.as_str(),
            "dispatch starting"
        );

        // ── Step 2: RBAC ─────────────────────────────────────────────────────
        //
        // The descriptor is read first only to learn its permission code; an
        // unknown function is reported after the permission check so callers
        // without access cannot map out the catalog.
        let descriptor = self.catalog.get(&call.function_id);
        let permission = descriptor
            .as_ref()
            .map(|d| d.permission())
            .unwrap_or_else(|| call.function_id.clone());

        // ── Step 3: Tenant scope ─────────────────────────────────────────────
        self.authorize(&call.caller, &permission, call.game(), call.env())?;

        // ── Step 4: Descriptor lookup ────────────────────────────────────────
        let descriptor = descriptor
            .ok_or_else(|| PitbossError::not_found(format!("function '{}'", call.function_id)))?;

        // ── Step 5: Payload shape ────────────────────────────────────────────
        let report = self.verifier.verify(&descriptor, &call.payload)?;
        if !report.passed {
            let (field, reason) = report
                .failures
                .first()
                .map(|f| (f.field_path.clone(), f.message.clone()))
                .unwrap_or_else(|| ("$".to_string(), "payload rejected".to_string()));
            warn!(trace_id = %call.trace_id, function_id = %call.function_id, field = %field, "payload rejected");
            return Err(PitbossError::InvalidArgument { field, reason });
        }
        if descriptor.semantics.idempotency_key && call.idempotency_key.as_deref().map_or(true, str::is_empty) {
            return Err(PitbossError::invalid(
                "idempotency_key",
                format!("function '{}' requires an idempotency key", descriptor.id),
            ));
        }

        // ── Step 6: Two-person rule ──────────────────────────────────────────
        if descriptor.auth.two_person_rule {
            let mut approval = Approval::pending(&call.caller.user, &descriptor.id, mode);
            approval.payload = call.payload.clone();
            approval.idempotency_key = call.idempotency_key.clone().unwrap_or_default();
            approval.route = call.route;
            approval.target_service_id = call.target_service_id.clone().unwrap_or_default();
            approval.hash_key = call.hash_key.clone().unwrap_or_default();
            approval.game_id = call.game().unwrap_or_default().to_string();
            approval.env = call.env().unwrap_or_default().to_string();

            let approval = self.approvals.create(approval).await?;
            info!(
                trace_id = %call.trace_id,
                approval_id = %approval.id,
                function_id = %descriptor.id,
                actor = %approval.actor,
                "call parked for two-person approval"
            );
            return Ok(Admission::Parked(approval));
        }

        Ok(Admission::Proceed(descriptor))
    }

    /// Steps 7 to 9: replay check, routing, and the forward itself.
    async fn execute(
        &self,
        call: &DispatchCall,
        descriptor: &FunctionDescriptor,
        mode: ApprovalMode,
    ) -> PitbossResult<Completion> {
        // ── Step 7: Idempotency ──────────────────────────────────────────────
        // Keys are per tenant and caller. A second call with a key already in
        // flight waits for the first one's result.
        let mut reservation = None;
        if let Some(k) = non_empty(call.idempotency_key.as_deref()) {
            let key = IdempotencyKey::new(mode, &descriptor.id, &descriptor.version, k).for_tenant(
                call.game().unwrap_or_default(),
                call.env().unwrap_or_default(),
                &call.caller.user,
            );
            match self.idempotency.claim(&key, &call.payload).await {
                Claim::Hit(cached) => return decode_cached(mode, cached),
                Claim::Conflict => {
                    return Err(PitbossError::Conflict {
                        reason: format!("idempotency key '{k}' was already used with a different payload"),
                    })
                }
                Claim::Reserved(r) => reservation = Some(r),
            }
        }

        // ── Step 8: Routing ──────────────────────────────────────────────────
        let plan = self.plan_route(call, descriptor)?;
        let timeout = self.call_timeout(call, descriptor)?;
        let mut budget = timeout + self.options.transport_grace;
        if let Some(deadline) = call.deadline {
            budget = budget.min(deadline);
        }
        let request = build_request(call, descriptor, &plan, timeout);

        debug!(
            trace_id = %call.trace_id,
            function_id = %descriptor.id,
            route = plan.route.as_str(),
            candidates = plan.attempts.len(),
            sweep = plan.sweep,
            timeout_ms = timeout.as_millis() as u64,
            "route planned"
        );

        // ── Step 9: Forward ──────────────────────────────────────────────────
        let completion = match mode {
            ApprovalMode::Invoke => {
                let (response, agent) = self
                    .forward(&plan, &descriptor.id, budget, |agent, hop| {
                        let transport = Arc::clone(&self.transport);
                        let request = request.clone();
                        async move { transport.invoke(&agent, request, hop).await }
                    })
                    .await?;
                debug!(trace_id = %call.trace_id, agent_id = %agent.agent_id, bytes = response.payload.len(), "invoke answered");
                Completion::Payload(response.payload)
            }
            ApprovalMode::StartJob => {
                let (response, agent) = self
                    .forward(&plan, &descriptor.id, budget, |agent, hop| {
                        let transport = Arc::clone(&self.transport);
                        let request = request.clone();
                        async move { transport.start_job(&agent, request, hop).await }
                    })
                    .await?;
                if response.job_id.is_empty() {
                    return Err(PitbossError::internal(format!(
                        "agent '{}' started a job without an id",
                        agent.agent_id
                    )));
                }
                let handle = JobHandle::new(&agent.agent_id, &response.job_id);
                info!(trace_id = %call.trace_id, job_handle = %handle, "job started");
                Completion::Job(JobStarted {
                    job_id: response.job_id,
                    job_handle: handle.to_string(),
                    agent_id: agent.agent_id.clone(),
                })
            }
        };

        if let Some(reservation) = reservation {
            reservation.complete(encode_cached(&completion)?);
        }
        Ok(completion)
    }

    fn plan_route(&self, call: &DispatchCall, descriptor: &FunctionDescriptor) -> PitbossResult<RoutePlan> {
        let route = call.route.unwrap_or(descriptor.semantics.route);
        let scope = self.scopes.scope_for(&call.caller);
        let mut candidates = self.registry.list_agents_for(&descriptor.id, call.game(), call.env());
        // A call without a game header may only reach tenants in scope.
        candidates.retain(|a| scope.permits_env(&a.game_id, &a.env));
        if candidates.is_empty() {
            return Err(PitbossError::NoProvider { function_id: descriptor.id.clone() });
        }
        let balancer = self.balancers.for_route(route);

        match route {
            Route::Lb | Route::HashKey => {
                let candidates = self.balancers.health().filter(candidates);
                let key = match route {
                    Route::HashKey => call.hash_key.as_deref(),
                    _ => None,
                };
                let idx = balancer
                    .pick(&candidates, key)
                    .ok_or_else(|| PitbossError::NoProvider { function_id: descriptor.id.clone() })?;
                let mut attempts = vec![Arc::clone(&candidates[idx])];
                if candidates.len() > 1 {
                    attempts.push(Arc::clone(&candidates[(idx + 1) % candidates.len()]));
                }
                Ok(RoutePlan { route, attempts, sweep: false, strip_target: false })
            }
            Route::ServiceId => {
                let target = non_empty(call.target_service_id.as_deref()).ok_or_else(|| {
                    PitbossError::invalid("target_service_id", "required when routing by service_id")
                })?;
                match balancer.pick(&candidates, Some(target)) {
                    Some(idx) => {
                        let agent = Arc::clone(&candidates[idx]);
                        let strip_target = agent.agent_id == target;
                        Ok(RoutePlan { route, attempts: vec![agent], sweep: false, strip_target })
                    }
                    None => Ok(RoutePlan { route, attempts: candidates, sweep: true, strip_target: false }),
                }
            }
        }
    }

    fn call_timeout(&self, call: &DispatchCall, descriptor: &FunctionDescriptor) -> PitbossResult<Duration> {
        let base = descriptor.timeout()?.unwrap_or(self.options.default_timeout);
        Ok(match call.deadline {
            Some(deadline) => base.min(deadline),
            None => base,
        })
    }

    /// Send to the planned agents in order under one shared deadline.
    ///
    /// A transport failure moves on to the next planned agent, which gives
    /// at most one retry outside a sweep. A remote error is final, except
    /// `no_provider` while sweeping.
    async fn forward<T, F, Fut>(
        &self,
        plan: &RoutePlan,
        function_id: &str,
        budget: Duration,
        mut send: F,
    ) -> PitbossResult<(T, Arc<AgentSession>)>
    where
        F: FnMut(Arc<AgentSession>, Duration) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let deadline = Instant::now() + budget;
        let mut last_err = None;

        for (attempt, agent) in plan.attempts.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_err = Some(PitbossError::DeadlineExceeded {
                    reason: format!("no time left for a call to '{function_id}'"),
                });
                break;
            }

            let mut in_flight = self.balancers.stats().begin(&agent.agent_id);
            let outcome = match tokio::time::timeout(remaining, send(Arc::clone(agent), remaining)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CallError::Transport(PitbossError::DeadlineExceeded {
                    reason: format!("no answer within {} ms", remaining.as_millis()),
                })),
            };

            let health = self.balancers.health();
            match outcome {
                Ok(value) => {
                    health.record_success(&agent.agent_id);
                    return Ok((value, Arc::clone(agent)));
                }
                Err(CallError::Remote(e)) if plan.sweep && e.kind() == ErrorKind::NoProvider => {
                    health.record_success(&agent.agent_id);
                    debug!(agent_id = %agent.agent_id, function_id, "sweep: agent has no matching instance");
                    last_err = Some(e);
                }
                Err(CallError::Remote(e)) => {
                    health.record_success(&agent.agent_id);
                    return Err(e);
                }
                Err(CallError::Transport(e)) => {
                    in_flight.fail();
                    health.record_failure(&agent.agent_id);
                    warn!(agent_id = %agent.agent_id, function_id, attempt, error = %e, "transport failure");
                    last_err = Some(e.with_context(format!("agent '{}'", agent.agent_id)));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| PitbossError::NoProvider { function_id: function_id.to_string() }))
    }

    // ── Approvals ────────────────────────────────────────────────────────────

    /// Approve a pending call and execute it once on behalf of its requester.
    ///
    /// The approval stays `approved` even when the execution then fails;
    /// the execution error is returned and audited.
    pub async fn approve(&self, caller: &Caller, id: &str, trace_id: &str) -> PitbossResult<(Approval, Completion)> {
        let approved = self.decide(caller, id, trace_id, Decision::Approve).await?;

        let call = DispatchCall::from_approval(&approved, trace_id);
        info!(trace_id, approval_id = %id, approver = %caller.user, function_id = %call.function_id, "executing approved call");
        let result = async {
            let descriptor = self
                .catalog
                .get(&call.function_id)
                .ok_or_else(|| PitbossError::not_found(format!("function '{}'", call.function_id)))?;
            self.execute(&call, &descriptor, approved.mode).await
        }
        .await;

        let outcome = outcome_code(&result);
        self.audit_call(&call, approved.mode.as_str(), &outcome, &[("approval_id", id), ("approved_by", caller.user.as_str())])
            .await;
        result.map(|completion| (approved, completion))
    }

    pub async fn reject(&self, caller: &Caller, id: &str, reason: &str, trace_id: &str) -> PitbossResult<Approval> {
        self.decide(caller, id, trace_id, Decision::Reject(reason)).await
    }

    async fn decide(&self, caller: &Caller, id: &str, trace_id: &str, decision: Decision<'_>) -> PitbossResult<Approval> {
        let (action, permission) = match decision {
            Decision::Approve => ("approve", permissions::APPROVALS_APPROVE),
            Decision::Reject(_) => ("reject", permissions::APPROVALS_REJECT),
        };

        let mut seen = None;
        let result = async {
            let current = self.approvals.get(id).await?;
            seen = Some((current.function_id.clone(), current.game_id.clone(), current.env.clone()));
            self.authorize(caller, permission, non_empty(Some(&current.game_id)), non_empty(Some(&current.env)))?;
            if matches!(decision, Decision::Approve) && current.actor == caller.user {
                return Err(PitbossError::forbidden(
                    ForbiddenReason::Rbac,
                    "an approval cannot be approved by its requester",
                ));
            }
            match decision {
                Decision::Approve => self.approvals.approve(id).await,
                Decision::Reject(reason) => self.approvals.reject(id, reason).await,
            }
        }
        .await;

        match &result {
            Ok(_) => info!(trace_id, approval_id = %id, user = %caller.user, action, "approval decided"),
            Err(e) => warn!(trace_id, approval_id = %id, user = %caller.user, action, error = %e, "approval decision refused"),
        }

        let mut entry = AuditEntry::new(&caller.user, action, outcome_code(&result)).detail("approval_id", id);
        entry.trace_id = trace_id.to_string();
        if let Some((function_id, game_id, env)) = seen {
            entry.function_id = function_id;
            entry.game_id = game_id;
            entry.env = env;
        }
        if let Decision::Reject(reason) = decision {
            if !reason.is_empty() {
                entry = entry.detail("reason", reason);
            }
        }
        self.record(entry).await;
        result
    }

    /// Approvals visible to the caller. Scope-restricted callers only see
    /// approvals of games they are scoped to.
    pub async fn list_approvals(
        &self,
        caller: &Caller,
        mut filter: ApprovalFilter,
        page: PageRequest,
    ) -> PitbossResult<(Vec<Approval>, u64)> {
        self.authorize(caller, permissions::APPROVALS_READ, None, None)?;
        if let Some(game) = filter.game_id.take() {
            filter.game_id = Some(self.resolve_game(&game));
        }
        let scope = self.scopes.scope_for(caller);
        if !scope.unrestricted {
            let mut games: Vec<String> = scope.games.keys().cloned().collect();
            games.sort();
            filter.games = Some(games);
        }
        self.approvals.list(&filter, page).await
    }

    pub async fn get_approval(&self, caller: &Caller, id: &str) -> PitbossResult<Approval> {
        let approval = self.approvals.get(id).await?;
        self.authorize(
            caller,
            permissions::APPROVALS_READ,
            non_empty(Some(&approval.game_id)),
            non_empty(Some(&approval.env)),
        )?;
        Ok(approval)
    }

    /// The stored payload with the descriptor's sensitive fields masked.
    /// `None` when the payload is not JSON.
    pub fn approval_preview(&self, approval: &Approval) -> Option<serde_json::Value> {
        let sensitive = self
            .catalog
            .get(&approval.function_id)
            .map(|d| d.ui.sensitive.clone())
            .unwrap_or_default();
        masking::masked_payload(&approval.payload, &sensitive)
    }

    // ── Jobs ─────────────────────────────────────────────────────────────────

    /// Relay a job's frames. The returned stream always ends with exactly
    /// one terminal frame; dropping it closes the agent connection.
    pub async fn stream_job(&self, caller: &Caller, handle: &str) -> PitbossResult<JobFrames> {
        let handle: JobHandle = handle.parse()?;
        let agent = self.job_agent(caller, &handle, permissions::JOBS_STREAM)?;
        let upstream = self.transport.stream_job(&agent, &handle.job_id).await?;
        debug!(job_handle = %handle, "job stream opened");

        Ok(relay_frames(upstream, format!("agent {}", agent.agent_id)))
    }

    /// Route a cancel to the agent named in the handle. Returns the job id
    /// the agent acknowledged.
    pub async fn cancel_job(&self, caller: &Caller, handle: &str, reason: &str, trace_id: &str) -> PitbossResult<String> {
        let mut agent_tenant = None;
        let result = async {
            let parsed: JobHandle = handle.parse()?;
            let agent = self.job_agent(caller, &parsed, permissions::JOBS_CANCEL)?;
            agent_tenant = Some((agent.game_id.clone(), agent.env.clone()));
            let request = CancelJobRequest { job_id: parsed.job_id.clone(), reason: reason.to_string() };
            let response = self.transport.cancel_job(&agent, request, self.options.cancel_timeout).await?;
            info!(trace_id, job_handle = %parsed, "job cancel acknowledged");
            Ok(response.job_id)
        }
        .await;

        let mut entry = AuditEntry::new(&caller.user, "cancel_job", outcome_code(&result)).detail("job_handle", handle);
        entry.trace_id = trace_id.to_string();
        if let Some((game_id, env)) = agent_tenant {
            entry.game_id = game_id;
            entry.env = env;
        }
        if !reason.is_empty() {
            entry = entry.detail("reason", reason);
        }
        self.record(entry).await;
        result
    }

    /// Jobs are scoped to the tenant of the agent holding them.
    fn job_agent(&self, caller: &Caller, handle: &JobHandle, permission: &str) -> PitbossResult<Arc<AgentSession>> {
        let agent = self
            .registry
            .get_agent(&handle.agent_id)
            .ok_or_else(|| PitbossError::not_found(format!("agent '{}'", handle.agent_id)))?;
        self.authorize(caller, permission, non_empty(Some(&agent.game_id)), non_empty(Some(&agent.env)))?;
        Ok(agent)
    }

    // ── Provider caps ────────────────────────────────────────────────────────

    /// Store an SDK manifest and register the descriptors it carries.
    /// Returns whether the caps were stored.
    pub fn register_provider_caps(&self, request: ProviderCapsRequest) -> PitbossResult<bool> {
        let manifest = if request.manifest.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&request.manifest)
                .map_err(|e| PitbossError::internal(format!("failed to encode manifest: {e}")))?
        };
        let stored = self.registry.upsert_provider_caps(ProviderCaps {
            id: request.id.clone(),
            version: request.version,
            lang: request.lang,
            sdk: request.sdk,
            manifest,
            updated_at: Utc::now(),
        });
        if stored {
            let added = self.catalog.register_manifest(&request.id, &request.manifest);
            debug!(provider_id = %request.id, descriptors = added, "provider manifest applied");
        }
        Ok(stored)
    }

    // ── Audit ────────────────────────────────────────────────────────────────

    async fn audit_dispatch<T>(&self, call: &DispatchCall, mode: ApprovalMode, result: &PitbossResult<Dispatched<T>>) {
        match result {
            Ok(Dispatched::Pending(approval)) => {
                self.audit_call(call, mode.as_str(), OUTCOME_PENDING, &[("approval_id", approval.id.as_str())]).await
            }
            Ok(Dispatched::Done(_)) => self.audit_call(call, mode.as_str(), OUTCOME_OK, &[]).await,
            Err(e) => self.audit_call(call, mode.as_str(), e.code(), &[]).await,
        }
    }

    async fn audit_call(&self, call: &DispatchCall, action: &str, outcome: &str, details: &[(&str, &str)]) {
        let sensitive = self
            .catalog
            .get(&call.function_id)
            .map(|d| d.ui.sensitive.clone())
            .unwrap_or_default();
        let mut entry = AuditEntry::new(&call.caller.user, action, outcome);
        entry.function_id = call.function_id.clone();
        entry.game_id = call.game().unwrap_or_default().to_string();
        entry.env = call.env().unwrap_or_default().to_string();
        entry.trace_id = call.trace_id.clone();
        entry.payload_hash = masking::payload_hash(&call.payload, &sensitive);
        for (key, value) in details {
            entry = entry.detail(*key, *value);
        }
        self.record(entry).await;
    }

    /// Append off the async runtime. A failed append is logged and the call
    /// result stands.
    async fn record(&self, entry: AuditEntry) {
        let sink = Arc::clone(&self.audit);
        let action = entry.action.clone();
        let trace_id = entry.trace_id.clone();
        match tokio::task::spawn_blocking(move || sink.append(&entry)).await {
            Ok(Ok(hash)) => debug!(trace_id = %trace_id, action = %action, hash = %hash, "audit record appended"),
            Ok(Err(e)) => error!(trace_id = %trace_id, action = %action, error = %e, "audit append failed"),
            Err(e) => error!(trace_id = %trace_id, action = %action, error = %e, "audit task failed"),
        }
    }
}

fn build_request(call: &DispatchCall, descriptor: &FunctionDescriptor, plan: &RoutePlan, timeout: Duration) -> InvokeRequest {
    let mut request = InvokeRequest::new(&descriptor.id, call.payload.clone());
    request.idempotency_key = call.idempotency_key.clone().unwrap_or_default();

    let target = if plan.strip_target { None } else { call.target_service_id.as_deref() };
    let entries = [
        (meta::TRACE_ID, Some(call.trace_id.as_str())),
        (meta::GAME_ID, call.game()),
        (meta::ENV, call.env()),
        (meta::ROUTE, Some(plan.route.as_str())),
        (meta::TARGET_SERVICE_ID, target),
        (meta::HASH_KEY, call.hash_key.as_deref()),
        (meta::CALLER, Some(call.caller.user.as_str())),
    ];
    for (key, value) in entries {
        if let Some(value) = non_empty(value) {
            request.metadata.insert(key.to_string(), value.to_string());
        }
    }
    request
        .metadata
        .insert(meta::TIMEOUT_MS.to_string(), timeout.as_millis().to_string());
    request
}

fn encode_cached(completion: &Completion) -> PitbossResult<Vec<u8>> {
    match completion {
        Completion::Payload(bytes) => Ok(bytes.clone()),
        Completion::Job(job) => serde_json::to_vec(job)
            .map_err(|e| PitbossError::internal(format!("failed to encode job receipt: {e}"))),
    }
}

fn decode_cached(mode: ApprovalMode, cached: Vec<u8>) -> PitbossResult<Completion> {
    match mode {
        ApprovalMode::Invoke => Ok(Completion::Payload(cached)),
        ApprovalMode::StartJob => serde_json::from_slice(&cached)
            .map(Completion::Job)
            .map_err(|e| PitbossError::internal(format!("cached job receipt is corrupt: {e}"))),
    }
}

fn outcome_code<T>(result: &PitbossResult<T>) -> String {
    match result {
        Ok(_) => OUTCOME_OK.to_string(),
        Err(e) => e.code().to_string(),
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.is_empty())
}
