use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pitboss_agent::{AgentConfig, AgentRuntime};
use pitboss_rpc::spawn_signal_listener;

#[derive(Parser, Debug)]
#[command(name = "pitboss-agent", about = "Per-host pitboss agent")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "PITBOSS_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PITBOSS_AGENT_LISTEN")]
    listen: Option<String>,

    #[arg(long, env = "PITBOSS_AGENT_ID")]
    agent_id: Option<String>,

    #[arg(long, env = "PITBOSS_GAME_ID")]
    game_id: Option<String>,

    #[arg(long, env = "PITBOSS_ENV")]
    env: Option<String>,

    /// Server base URL; omit to run standalone.
    #[arg(long, env = "PITBOSS_SERVER_URL")]
    server_url: Option<String>,

    #[arg(long, env = "PITBOSS_CONTROL_TOKEN", hide_env_values = true)]
    control_token: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)?,
            None => AgentConfig::default(),
        };
        if let Some(v) = self.listen {
            config.listen_addr = v;
        }
        if let Some(v) = self.agent_id {
            config.agent_id = v;
        }
        if let Some(v) = self.game_id {
            config.game_id = v;
        }
        if let Some(v) = self.env {
            config.env = v;
        }
        if self.server_url.is_some() {
            config.server_url = self.server_url;
        }
        if self.control_token.is_some() {
            config.control_token = self.control_token;
        }
        config.validate().context("invalid agent configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Args::parse().into_config()?;
    let runtime = AgentRuntime::bind(config).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    runtime.run(shutdown).await?;

    info!("agent stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();
}
