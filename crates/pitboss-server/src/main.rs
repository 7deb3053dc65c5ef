use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pitboss_rpc::spawn_signal_listener;
use pitboss_server::{ServerConfig, ServerRuntime};

#[derive(Parser, Debug)]
#[command(name = "pitboss-server", about = "pitboss control-plane server")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "PITBOSS_SERVER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PITBOSS_SERVER_LISTEN")]
    listen: Option<String>,

    #[arg(long, env = "PITBOSS_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    #[arg(long, env = "PITBOSS_CONTROL_TOKEN", hide_env_values = true)]
    control_token: Option<String>,

    #[arg(long, env = "PITBOSS_POLICY_FILE")]
    policy_file: Option<PathBuf>,

    #[arg(long, env = "PITBOSS_DESCRIPTORS_DIR")]
    descriptors_dir: Option<PathBuf>,

    #[arg(long, env = "PITBOSS_AUDIT_PATH")]
    audit_path: Option<PathBuf>,

    /// SQLite URL for approvals, e.g. `sqlite:pitboss.db`.
    #[arg(long, env = "PITBOSS_APPROVALS_DB")]
    approvals_db: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str::<ServerConfig>(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => ServerConfig::default(),
        };
        if let Some(v) = self.listen {
            config.listen_addr = v;
        }
        if let Some(v) = self.jwt_secret {
            config.jwt_secret = v;
        }
        if self.control_token.is_some() {
            config.control_token = self.control_token;
        }
        if self.policy_file.is_some() {
            config.policy_file = self.policy_file;
        }
        if self.descriptors_dir.is_some() {
            config.descriptors_dir = self.descriptors_dir;
        }
        if self.audit_path.is_some() {
            config.audit_path = self.audit_path;
        }
        if self.approvals_db.is_some() {
            config.approvals_db = self.approvals_db;
        }
        config.validate().context("invalid server configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Args::parse().into_config()?;
    let runtime = ServerRuntime::bind(config).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    runtime.run(shutdown).await?;

    info!("server stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();
}
