//! # pitboss-sdk
//!
//! Host function handlers in a local instance. The instance serves the
//! function RPC surface (`/rpc/*`) on its own listener, registers the
//! functions it hosts with the co-located agent, and keeps that
//! registration alive with heartbeats.
//!
//! ```no_run
//! use pitboss_contracts::descriptor::FunctionDescriptor;
//! use pitboss_sdk::{invoke_fn, InstanceBuilder};
//!
//! # async fn run() -> pitboss_contracts::error::PitbossResult<()> {
//! let instance = InstanceBuilder::new("moderation-1")
//!     .agent_addr("127.0.0.1:19090")
//!     .invoke(FunctionDescriptor::new("player.ban"), invoke_fn(|_call, payload| async move { Ok(payload) }))
//!     .bind()
//!     .await?;
//! instance.run(tokio_util::sync::CancellationToken::new()).await
//! # }
//! ```

pub mod config;
pub mod handler;
pub mod job;
pub mod register;
pub mod routes;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pitboss_contracts::{
    descriptor::FunctionDescriptor,
    error::{PitbossError, PitbossResult},
    wire::{LocalFunction, ProviderCapsRequest, RegisterLocalRequest},
};
use pitboss_rpc::{serve_until, ControlClient, LocalControlClient};
use pitboss_verify::JsonSchemaVerifier;

pub use config::InstanceConfig;
pub use handler::{invoke_fn, job_fn, CallContext, InvokeHandler, JobHandler};
pub use job::{JobContext, JobRuntime};
pub use register::Registrar;
pub use routes::{build_router, HostedFunction, InstanceState, Registered};

pub const SDK_NAME: &str = "pitboss-sdk";

/// A random 32-hex-digit idempotency key.
pub fn new_idempotency_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub struct InstanceBuilder {
    config: InstanceConfig,
    functions: HashMap<String, HostedFunction>,
}

impl InstanceBuilder {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self::from_config(InstanceConfig { service_id: service_id.into(), ..InstanceConfig::default() })
    }

    pub fn from_config(config: InstanceConfig) -> Self {
        Self { config, functions: HashMap::new() }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn agent_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.agent_addr = addr.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.heartbeat_interval_secs = interval.as_secs().max(1);
        self
    }

    /// Upload the provider manifest to this Server on start.
    pub fn server(mut self, url: impl Into<String>, control_token: Option<String>) -> Self {
        self.config.server_url = Some(url.into());
        self.config.control_token = control_token;
        self
    }

    /// Host a call handler. A later registration of the same id replaces
    /// the earlier one.
    pub fn invoke(mut self, descriptor: FunctionDescriptor, handler: Arc<dyn InvokeHandler>) -> Self {
        self.functions
            .insert(descriptor.id.clone(), HostedFunction { descriptor, handler: Registered::Invoke(handler) });
        self
    }

    pub fn job(mut self, descriptor: FunctionDescriptor, handler: Arc<dyn JobHandler>) -> Self {
        self.functions
            .insert(descriptor.id.clone(), HostedFunction { descriptor, handler: Registered::Job(handler) });
        self
    }

    pub async fn bind(self) -> PitbossResult<Instance> {
        self.config.validate()?;
        if self.functions.is_empty() {
            return Err(PitbossError::config("an instance must host at least one function"));
        }
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| PitbossError::config(format!("cannot listen on '{}': {}", self.config.listen_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PitbossError::internal(format!("listener has no address: {e}")))?;
        let state = InstanceState {
            functions: Arc::new(self.functions),
            jobs: Arc::new(JobRuntime::new(self.config.job_retention())),
            verifier: Arc::new(JsonSchemaVerifier::new()),
        };
        Ok(Instance { config: self.config, listener, local_addr, state })
    }
}

/// A bound local instance, ready to run.
pub struct Instance {
    config: InstanceConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    state: InstanceState,
}

impl Instance {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service_id(&self) -> &str {
        &self.config.service_id
    }

    pub fn advertise_addr(&self) -> String {
        if self.config.advertise_addr.is_empty() {
            self.local_addr.to_string()
        } else {
            self.config.advertise_addr.clone()
        }
    }

    pub fn register_request(&self) -> RegisterLocalRequest {
        let mut functions: Vec<LocalFunction> = self
            .state
            .functions
            .values()
            .map(|f| LocalFunction { id: f.descriptor.id.clone(), version: f.descriptor.version.clone() })
            .collect();
        functions.sort_by(|a, b| a.id.cmp(&b.id));
        RegisterLocalRequest {
            service_id: self.config.service_id.clone(),
            version: self.config.version.clone(),
            rpc_addr: self.advertise_addr(),
            functions,
        }
    }

    /// The provider manifest: every hosted descriptor under `functions`.
    pub fn manifest(&self) -> Value {
        let mut descriptors: Vec<&FunctionDescriptor> = self.state.functions.values().map(|f| &f.descriptor).collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        json!({ "service_id": self.config.service_id, "functions": descriptors })
    }

    async fn upload_manifest(&self) -> PitbossResult<()> {
        let Some(url) = &self.config.server_url else {
            return Ok(());
        };
        let client = ControlClient::new(url, self.config.control_token.clone())?;
        let request = ProviderCapsRequest {
            id: self.config.service_id.clone(),
            version: self.config.version.clone(),
            lang: "rust".to_string(),
            sdk: SDK_NAME.to_string(),
            manifest: self.manifest(),
        };
        let response = client.provider_caps(&request).await?;
        info!(service_id = %self.config.service_id, updated = response.updated, "provider manifest uploaded");
        Ok(())
    }

    /// Serve until `shutdown` fires. Registration runs alongside; running
    /// jobs are cancelled on the way out.
    pub async fn run(self, shutdown: CancellationToken) -> PitbossResult<()> {
        if let Err(e) = self.upload_manifest().await {
            warn!(error = %e, "provider manifest upload failed");
        }
        let registrar = Registrar::new(
            LocalControlClient::new(&self.config.agent_addr)?,
            self.register_request(),
            self.config.heartbeat_interval(),
        );

        info!(
            addr = %self.local_addr,
            service_id = %self.config.service_id,
            agent = %self.config.agent_addr,
            functions = self.state.functions.len(),
            "instance listening"
        );
        let jobs = Arc::clone(&self.state.jobs);
        let register_task = tokio::spawn(registrar.run(shutdown.clone()));
        let served = serve_until(self.listener, build_router(self.state), shutdown.clone(), self.config.shutdown_grace()).await;
        shutdown.cancel();
        jobs.cancel_all();
        let _ = register_task.await;
        served
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pitboss_agent::{AgentConfig, AgentRuntime};

    use super::*;

    #[test]
    fn idempotency_keys_are_unique_hex() {
        let a = new_idempotency_key();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, new_idempotency_key());
    }

    #[tokio::test]
    async fn bind_requires_a_function() {
        match InstanceBuilder::new("svc").bind().await {
            Err(e) => assert!(e.to_string().contains("at least one function")),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[tokio::test]
    async fn instance_registers_and_is_callable_through_the_agent() {
        let agent = AgentRuntime::bind(AgentConfig { listen_addr: "127.0.0.1:0".to_string(), ..AgentConfig::default() })
            .await
            .unwrap();
        let agent_addr = agent.local_addr().to_string();
        let token = CancellationToken::new();
        tokio::spawn(agent.run(token.clone()));

        let instance = InstanceBuilder::new("svc-echo")
            .agent_addr(agent_addr.clone())
            .invoke(FunctionDescriptor::new("echo.say"), invoke_fn(|_call, payload| async move { Ok(payload) }))
            .bind()
            .await
            .unwrap();
        let manifest = instance.manifest();
        assert_eq!(manifest["functions"][0]["id"], "echo.say");
        tokio::spawn(instance.run(token.clone()));

        let control = LocalControlClient::new(&agent_addr).unwrap();
        let mut registered = false;
        for _ in 0..50 {
            if !control.list().await.unwrap().functions.is_empty() {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registered);

        let client = pitboss_rpc::RpcClient::new(Duration::from_secs(1)).unwrap();
        let request = pitboss_contracts::wire::InvokeRequest::new("echo.say", b"hi".to_vec());
        let response = client.invoke(&agent_addr, &request, Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.payload, b"hi".to_vec());
        token.cancel();
    }
}
