//! Scenario 1: Registration to invoke round trip
//!
//! An instance behind agent `a1` hosts `player.ban`. A game master bans a
//! player through `POST /api/invoke`; the response carries exactly the bytes
//! the handler produced and the audit chain gains one `ok` record.

use reqwest::StatusCode;
use serde_json::json;

use pitboss_contracts::error::{PitbossError, PitbossResult};
use pitboss_sdk::CallContext;

use super::{ensure, ensure_status, header, send, step};
use crate::handlers;
use crate::players::PlayerStore;
use crate::stack::{Stack, StackOptions};

pub async fn run_scenario() -> PitbossResult<()> {
    header("Scenario 1: Registration -> invoke round trip");
    let stack = Stack::start(StackOptions::default()).await?;
    let result = run(&stack).await;
    stack.shutdown().await;
    result
}

async fn run(stack: &Stack) -> PitbossResult<()> {
    step(1, "instance ref-a1 registered player.ban with agent a1; a1 registered upstream");
    ensure(stack.routable_agents("player.ban").await? == 1, "player.ban should have one live agent")?;

    let payload = json!({ "player_id": "u-1", "reason": "cheat" });
    let response = send(stack.dispatch("gm-alice", "/api/invoke", "g1", "dev", "player.ban", payload.clone())?).await?;
    ensure_status(&response, StatusCode::OK)?;
    let trace_id = response
        .headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response
        .bytes()
        .await
        .map_err(|e| PitbossError::internal(format!("cannot read the response: {e}")))?;
    step(2, &format!("gm-alice invoked player.ban -> {}", String::from_utf8_lossy(&body)));

    // The same handler against a pristine table yields the bytes to expect.
    let raw = serde_json::to_vec(&payload).unwrap_or_default();
    let expected = handlers::ban(&PlayerStore::seeded(), &CallContext::default(), &raw).await?;
    ensure(body.as_ref() == expected.as_slice(), "response bytes differ from the handler's")?;
    ensure(stack.store().get("u-1")?.banned, "u-1 should be banned")?;
    step(3, "response bytes match the handler output exactly");

    let records = stack.audit_records()?;
    let invokes: Vec<_> = records.iter().filter(|r| r.action == "invoke").collect();
    ensure(invokes.len() == 1, format!("expected one invoke record, found {}", invokes.len()))?;
    let record = invokes[0];
    ensure(record.outcome == "ok" && record.function_id == "player.ban", "invoke record should be ok for player.ban")?;
    ensure(record.trace_id == trace_id, "audit trace id should match the response header")?;
    ensure(stack.audit_intact()?, "audit chain should verify")?;
    step(4, &format!("audit: seq {} invoke player.ban ok, chain intact", record.sequence));
    Ok(())
}

#[cfg(test)]
mod tests {
    #[tokio::test(flavor = "multi_thread")]
    async fn invoke_round_trip() {
        super::run_scenario().await.unwrap();
    }
}
