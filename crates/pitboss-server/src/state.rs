//! Shared Server state and its assembly from configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use pitboss_audit::{FileAuditSink, InMemoryAuditSink};
use pitboss_contracts::error::PitbossResult;
use pitboss_core::{
    traits::{AuditSink, PermissionPolicy, ScopeResolver},
    DispatchOptions, Dispatcher, DispatcherParts, FunctionCatalog, IdempotencyCache,
};
use pitboss_policy::TomlRbacPolicy;
use pitboss_registry::{Balancers, HealthTracker, Registry};
use pitboss_verify::JsonSchemaVerifier;

use crate::auth::JwtAuth;
use crate::config::ServerConfig;
use crate::transport::HttpAgentTransport;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub policy: Arc<dyn PermissionPolicy>,
    pub scopes: Arc<dyn ScopeResolver>,
    pub audit: Arc<dyn AuditSink>,
    pub auth: Arc<JwtAuth>,
    pub control_token: Option<Arc<str>>,
    pub agent_ttl: Duration,
}

impl AppState {
    /// Build every collaborator the configuration names.
    pub async fn from_config(config: &ServerConfig) -> PitbossResult<Self> {
        config.validate()?;

        let policy = Arc::new(match &config.policy_file {
            Some(path) => TomlRbacPolicy::from_file(path)?,
            None => {
                info!("no policy_file configured; using the bundled policy");
                TomlRbacPolicy::bundled()?
            }
        });

        let catalog = Arc::new(FunctionCatalog::new());
        if let Some(dir) = &config.descriptors_dir {
            let loaded = catalog.load_dir(dir)?;
            info!(dir = %dir.display(), descriptors = loaded, "descriptors loaded");
        }

        let audit: Arc<dyn AuditSink> = match &config.audit_path {
            Some(path) => Arc::new(FileAuditSink::open(path, config.audit_fsync)?),
            None => {
                warn!("no audit_path configured; the audit chain is kept in memory only");
                Arc::new(InMemoryAuditSink::new())
            }
        };

        let approvals = pitboss_approvals::open_store(config.approvals_db.as_deref()).await?;
        let transport = Arc::new(HttpAgentTransport::new(config.connect_timeout())?);

        let strategy = config.lb_strategy()?;
        info!(lb_strategy = ?strategy, health_cooldown_secs = config.health_cooldown_secs, "routing configured");
        let balancers = Balancers::with_strategy(strategy, HealthTracker::new(config.health_cooldown()));

        let dispatcher = Dispatcher::new(DispatcherParts {
            catalog,
            registry: Arc::new(Registry::new()),
            balancers,
            idempotency: Arc::new(IdempotencyCache::new(config.idempotency_ttl(), config.idempotency_capacity)),
            policy: policy.clone(),
            scopes: policy.clone(),
            verifier: Arc::new(JsonSchemaVerifier::new()),
            approvals,
            audit: Arc::clone(&audit),
            transport,
            options: DispatchOptions { default_timeout: config.call_timeout(), ..DispatchOptions::default() },
        });

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            policy: policy.clone(),
            scopes: policy,
            audit,
            auth: Arc::new(JwtAuth::new(&config.jwt_secret)),
            control_token: config.control_token.as_deref().filter(|t| !t.is_empty()).map(Arc::from),
            agent_ttl: config.agent_ttl(),
        })
    }
}
