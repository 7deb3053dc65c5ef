//! Scenario 6: Heartbeat expiry
//!
//! Agents `a1` and `a2` both serve `player.ban` with a two-second session
//! TTL. When `a1` goes silent its session lapses and calls route to `a2`
//! alone; once `a2` is silent too, the call fails with `no_provider`.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use pitboss_contracts::error::PitbossResult;

use super::{ensure, ensure_status, error_body, header, send, step};
use crate::stack::{Stack, StackOptions};

const TTL_SECS: u64 = 2;

pub async fn run_scenario() -> PitbossResult<()> {
    header("Scenario 6: Heartbeat expiry");
    let options = StackOptions {
        agents: vec!["a1".to_string(), "a2".to_string()],
        agent_ttl_secs: TTL_SECS,
        heartbeat_secs: 1,
        ..StackOptions::default()
    };
    let mut stack = Stack::start(options).await?;
    let result = run(&mut stack).await;
    stack.shutdown().await;
    result
}

async fn lapse() {
    tokio::time::sleep(Duration::from_millis(TTL_SECS * 1_000 + 600)).await;
}

async fn ban(stack: &Stack, player_id: &str) -> PitbossResult<reqwest::Response> {
    send(stack.dispatch("gm-alice", "/api/invoke", "g1", "dev", "player.ban", json!({ "player_id": player_id, "reason": "afk farming" }))?).await
}

async fn run(stack: &mut Stack) -> PitbossResult<()> {
    ensure(stack.routable_agents("player.ban").await? == 2, "both agents should serve player.ban")?;
    step(1, "a1 and a2 both serve player.ban");

    stack.stop_agent("a1").await?;
    lapse().await;
    ensure(stack.routable_agents("player.ban").await? == 1, "only a2 should remain routable")?;
    let registry = stack.admin_get("/api/registry").await?;
    let a1_healthy = registry
        .as_array()
        .into_iter()
        .flatten()
        .find(|a| a["agent_id"] == "a1")
        .map(|a| a["healthy"] == true);
    ensure(a1_healthy != Some(true), "a1 must not be reported healthy")?;
    step(2, "a1 went silent; its session lapsed and it is no longer routable");

    let response = ban(stack, "u-5").await?;
    ensure_status(&response, StatusCode::OK)?;
    ensure(stack.store().get("u-5")?.banned, "the ban should have run on a2")?;
    step(3, "player.ban routed to a2 transparently");

    stack.stop_agent("a2").await?;
    lapse().await;
    let response = ban(stack, "u-4").await?;
    ensure_status(&response, StatusCode::SERVICE_UNAVAILABLE)?;
    let body = error_body(response).await?;
    ensure(body.code == "no_provider", format!("expected no_provider, got {}", body.code))?;
    step(4, "with every agent silent, player.ban fails with 503 no_provider");
    Ok(())
}
