//! One Server, its agents, and an SDK instance behind each agent, all on
//! ephemeral loopback ports inside the current tokio runtime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pitboss_agent::{AgentConfig, AgentRuntime};
use pitboss_audit::{AuditRecord, FileAuditSink};
use pitboss_contracts::error::{PitbossError, PitbossResult};
use pitboss_rpc::LocalControlClient;
use pitboss_server::{JwtAuth, ServerConfig, ServerRuntime};

use crate::handlers;
use crate::players::PlayerStore;
use crate::{DESCRIPTOR_FILES, POLICY};

const JWT_SECRET: &str = "ref-game-secret";
const CONTROL_TOKEN: &str = "ref-game-control";
const ADMIN_USER: &str = "ops-admin";
const WAIT_STEP: Duration = Duration::from_millis(25);
const WAIT_LIMIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StackOptions {
    /// One agent, with one instance behind it, per id.
    pub agents: Vec<String>,
    pub game_id: String,
    pub env: String,
    pub agent_ttl_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            agents: vec!["a1".to_string()],
            game_id: "g1".to_string(),
            env: "dev".to_string(),
            agent_ttl_secs: 60,
            heartbeat_secs: 1,
        }
    }
}

struct Process {
    token: CancellationToken,
    task: JoinHandle<PitbossResult<()>>,
}

impl Process {
    async fn stop(self) {
        self.token.cancel();
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "process stopped with an error"),
            Err(e) => debug!(error = %e, "process task failed"),
        }
    }
}

struct AgentSlot {
    id: String,
    addr: SocketAddr,
    agent: Option<Process>,
    instance: Option<Process>,
}

pub struct Stack {
    dir: TempDir,
    options: StackOptions,
    base_url: String,
    auth: Arc<JwtAuth>,
    http: reqwest::Client,
    store: Arc<PlayerStore>,
    server: Option<Process>,
    agents: Vec<AgentSlot>,
}

fn io_err(what: &str, e: std::io::Error) -> PitbossError {
    PitbossError::internal(format!("{what}: {e}"))
}

fn http_err(e: reqwest::Error) -> PitbossError {
    PitbossError::UpstreamUnavailable { reason: e.to_string() }
}

impl Stack {
    /// Start every process and wait until each agent's functions are
    /// routable from the Server.
    pub async fn start(options: StackOptions) -> PitbossResult<Self> {
        let dir = tempfile::tempdir().map_err(|e| io_err("cannot create a work dir", e))?;
        let policy_file = dir.path().join("policy.toml");
        std::fs::write(&policy_file, POLICY).map_err(|e| io_err("cannot write the policy", e))?;
        let descriptors_dir = dir.path().join("descriptors");
        std::fs::create_dir_all(&descriptors_dir).map_err(|e| io_err("cannot create the descriptor dir", e))?;
        for (name, json) in DESCRIPTOR_FILES {
            std::fs::write(descriptors_dir.join(name), json).map_err(|e| io_err("cannot write a descriptor", e))?;
        }

        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            jwt_secret: JWT_SECRET.to_string(),
            control_token: Some(CONTROL_TOKEN.to_string()),
            policy_file: Some(policy_file),
            descriptors_dir: Some(descriptors_dir),
            audit_path: Some(dir.path().join("audit.log")),
            audit_fsync: true,
            agent_ttl_secs: options.agent_ttl_secs,
            reaper_interval_secs: 0,
            shutdown_grace_secs: 1,
            ..ServerConfig::default()
        };
        let server = ServerRuntime::bind(config).await?;
        let base_url = format!("http://{}", server.local_addr());
        let auth = Arc::clone(&server.state().auth);
        let token = CancellationToken::new();
        let server = Process { task: tokio::spawn(server.run(token.clone())), token };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PitbossError::internal(format!("cannot build an HTTP client: {e}")))?;

        let mut stack = Self {
            dir,
            options: options.clone(),
            base_url,
            auth,
            http,
            store: Arc::new(PlayerStore::seeded()),
            server: Some(server),
            agents: Vec::new(),
        };
        for agent_id in &options.agents {
            let (addr, agent) = stack.spawn_agent(agent_id, "127.0.0.1:0").await?;
            let instance = stack.spawn_instance(agent_id, addr).await?;
            stack.agents.push(AgentSlot { id: agent_id.clone(), addr, agent: Some(agent), instance: Some(instance) });
        }
        for function_id in ["player.ban", "player.wipe", "reports.export"] {
            stack.wait_for_agents(function_id, options.agents.len()).await?;
        }
        info!(server = %stack.base_url, agents = options.agents.len(), "reference stack up");
        Ok(stack)
    }

    async fn spawn_agent(&self, agent_id: &str, listen_addr: &str) -> PitbossResult<(SocketAddr, Process)> {
        let config = AgentConfig {
            agent_id: agent_id.to_string(),
            game_id: self.options.game_id.clone(),
            env: self.options.env.clone(),
            listen_addr: listen_addr.to_string(),
            server_url: Some(self.base_url.clone()),
            control_token: Some(CONTROL_TOKEN.to_string()),
            heartbeat_interval_secs: self.options.heartbeat_secs,
            shutdown_grace_secs: 1,
            ..AgentConfig::default()
        };
        let runtime = AgentRuntime::bind(config).await?;
        let addr = runtime.local_addr();
        let token = CancellationToken::new();
        Ok((addr, Process { task: tokio::spawn(runtime.run(token.clone())), token }))
    }

    async fn spawn_instance(&self, agent_id: &str, agent_addr: SocketAddr) -> PitbossResult<Process> {
        let instance = handlers::instance(&format!("ref-{agent_id}"), Arc::clone(&self.store))?
            .agent_addr(agent_addr.to_string())
            .heartbeat_interval(Duration::from_secs(self.options.heartbeat_secs))
            .server(self.base_url.clone(), Some(CONTROL_TOKEN.to_string()))
            .bind()
            .await?;
        let token = CancellationToken::new();
        Ok(Process { task: tokio::spawn(instance.run(token.clone())), token })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &Arc<PlayerStore> {
        &self.store
    }

    pub fn agent_addr(&self, agent_id: &str) -> Option<SocketAddr> {
        self.agents.iter().find(|a| a.id == agent_id).map(|a| a.addr)
    }

    /// A bearer token for a user of the policy directory.
    pub fn token(&self, user: &str) -> PitbossResult<String> {
        self.auth.issue_token(user, &[], Duration::from_secs(600))
    }

    /// An authenticated admin API request.
    pub fn api(&self, user: &str, method: Method, path: &str) -> PitbossResult<RequestBuilder> {
        Ok(self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(self.token(user)?))
    }

    /// `POST /api/invoke` (or `/api/jobs`) for `game`/`env`.
    pub fn dispatch(
        &self,
        user: &str,
        path: &str,
        game: &str,
        env: &str,
        function_id: &str,
        payload: Value,
    ) -> PitbossResult<RequestBuilder> {
        Ok(self
            .api(user, Method::POST, path)?
            .header("x-game-id", game)
            .header("x-env", env)
            .json(&serde_json::json!({ "function_id": function_id, "payload": payload })))
    }

    /// `GET` a JSON document as the stack's admin.
    pub async fn admin_get(&self, path: &str) -> PitbossResult<Value> {
        let token = self.auth.issue_token(ADMIN_USER, &["admin"], Duration::from_secs(600))?;
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(http_err)?;
        response.json().await.map_err(http_err)
    }

    /// Live agents the Server would route `function_id` to.
    pub async fn routable_agents(&self, function_id: &str) -> PitbossResult<u64> {
        let functions = self.admin_get("/api/functions").await?;
        Ok(functions
            .as_array()
            .into_iter()
            .flatten()
            .find(|f| f["id"] == function_id)
            .and_then(|f| f["agents"].as_u64())
            .unwrap_or(0))
    }

    async fn wait_for_agents(&self, function_id: &str, count: usize) -> PitbossResult<()> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        while tokio::time::Instant::now() < deadline {
            if self.routable_agents(function_id).await? >= count as u64 {
                return Ok(());
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        Err(PitbossError::DeadlineExceeded { reason: format!("'{function_id}' never reached {count} agent(s)") })
    }

    async fn wait_for_instance(addr: SocketAddr) -> PitbossResult<()> {
        let control = LocalControlClient::new(&addr.to_string())?;
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        while tokio::time::Instant::now() < deadline {
            if !control.list().await?.functions.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        Err(PitbossError::DeadlineExceeded { reason: format!("no instance registered with the agent at {addr}") })
    }

    fn slot(&mut self, agent_id: &str) -> PitbossResult<&mut AgentSlot> {
        self.agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| PitbossError::not_found(format!("agent '{agent_id}'")))
    }

    /// Stop an agent and start a fresh one on the same address. The new
    /// process starts with empty local state; this returns once the
    /// instance has registered with it again.
    pub async fn restart_agent(&mut self, agent_id: &str) -> PitbossResult<()> {
        let slot = self.slot(agent_id)?;
        let addr = slot.addr;
        if let Some(agent) = slot.agent.take() {
            agent.stop().await;
        }
        let (_, agent) = self.spawn_agent(agent_id, &addr.to_string()).await?;
        self.slot(agent_id)?.agent = Some(agent);
        info!(agent_id, %addr, "agent restarted");
        Self::wait_for_instance(addr).await
    }

    /// Stop an agent and its instance without telling the Server.
    pub async fn stop_agent(&mut self, agent_id: &str) -> PitbossResult<()> {
        let slot = self.slot(agent_id)?;
        let (agent, instance) = (slot.agent.take(), slot.instance.take());
        if let Some(instance) = instance {
            instance.stop().await;
        }
        if let Some(agent) = agent {
            agent.stop().await;
        }
        info!(agent_id, "agent stopped");
        Ok(())
    }

    /// Every record of the audit chain on disk.
    pub fn audit_records(&self) -> PitbossResult<Vec<AuditRecord>> {
        let path = self.dir.path().join("audit.log");
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err("cannot read the audit log", e))?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| PitbossError::internal(format!("bad audit line: {e}"))))
            .collect()
    }

    pub fn audit_intact(&self) -> PitbossResult<bool> {
        Ok(FileAuditSink::verify_file(self.dir.path().join("audit.log"))?.is_none())
    }

    pub async fn shutdown(mut self) {
        for slot in std::mem::take(&mut self.agents) {
            if let Some(instance) = slot.instance {
                instance.stop().await;
            }
            if let Some(agent) = slot.agent {
                agent.stop().await;
            }
        }
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
    }
}
