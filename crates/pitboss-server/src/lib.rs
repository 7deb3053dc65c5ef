//! # pitboss-server
//!
//! The control-plane Server. It owns the registry of agents, the function
//! catalog, the approval store, and the audit chain, and exposes:
//!
//! - the admin API under `/api/*` (JWT bearer auth, RBAC, tenant scopes),
//! - the agent control surface under `/control/*`,
//! - `/healthz`.
//!
//! Dispatch itself lives in `pitboss-core`; this crate wires the concrete
//! collaborators together and puts HTTP in front of them.

pub mod auth;
pub mod config;
pub mod reaper;
pub mod routes;
pub mod state;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pitboss_contracts::error::{PitbossError, PitbossResult};
use pitboss_rpc::serve_until;

pub use auth::JwtAuth;
pub use config::ServerConfig;
pub use routes::build_router;
pub use state::AppState;
pub use transport::HttpAgentTransport;

/// A bound Server, ready to run.
pub struct ServerRuntime {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    state: AppState,
}

impl ServerRuntime {
    pub async fn bind(config: ServerConfig) -> PitbossResult<Self> {
        let state = AppState::from_config(&config).await?;
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| PitbossError::config(format!("cannot listen on '{}': {}", config.listen_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PitbossError::internal(format!("listener has no address: {e}")))?;
        Ok(Self { config, listener, local_addr, state })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` fires, then stop the reaper and flush the
    /// audit chain.
    pub async fn run(self, shutdown: CancellationToken) -> PitbossResult<()> {
        let reaper = self.config.reaper_interval().map(|interval| {
            tokio::spawn(reaper::run_reaper(
                Arc::clone(self.state.dispatcher.registry()),
                interval,
                self.config.reaper_grace(),
                shutdown.clone(),
            ))
        });

        info!(addr = %self.local_addr, "server listening");
        let audit = Arc::clone(&self.state.audit);
        let served = serve_until(
            self.listener,
            build_router(self.state),
            shutdown.clone(),
            self.config.shutdown_grace(),
        )
        .await;

        shutdown.cancel();
        if let Some(task) = reaper {
            let _ = task.await;
        }
        match tokio::task::spawn_blocking(move || audit.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "audit flush failed"),
            Err(e) => warn!(error = %e, "audit flush task failed"),
        }
        served
    }
}
