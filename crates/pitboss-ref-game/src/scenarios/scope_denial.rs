//! Scenario 2: Scope denial
//!
//! gm-alice is scoped to Dragon Realm (`g1`) only. A call naming Star Forge
//! (`g2`) is refused with `forbidden`/`scope_game` before any routing; gm-dave,
//! limited to `g1/dev`, is refused `g1/prod` with `scope_env`.

use reqwest::StatusCode;
use serde_json::json;

use pitboss_contracts::error::PitbossResult;

use super::{ensure, ensure_status, error_body, header, send, step};
use crate::stack::{Stack, StackOptions};

pub async fn run_scenario() -> PitbossResult<()> {
    header("Scenario 2: Scope denial");
    let stack = Stack::start(StackOptions::default()).await?;
    let result = run(&stack).await;
    stack.shutdown().await;
    result
}

async fn run(stack: &Stack) -> PitbossResult<()> {
    let payload = json!({ "player_id": "u-2", "reason": "spam" });

    let response = send(stack.dispatch("gm-alice", "/api/invoke", "g2", "dev", "player.ban", payload.clone())?).await?;
    ensure_status(&response, StatusCode::FORBIDDEN)?;
    let body = error_body(response).await?;
    let reason = body.details.as_ref().and_then(|d| d["reason"].as_str()).unwrap_or_default().to_string();
    ensure(body.code == "forbidden" && reason == "scope_game", format!("got {}/{}", body.code, reason))?;
    step(1, "gm-alice -> g2: 403 forbidden (scope_game)");

    let response = send(stack.dispatch("gm-dave", "/api/invoke", "g1", "prod", "player.ban", payload)?).await?;
    ensure_status(&response, StatusCode::FORBIDDEN)?;
    let body = error_body(response).await?;
    let reason = body.details.as_ref().and_then(|d| d["reason"].as_str()).unwrap_or_default().to_string();
    ensure(reason == "scope_env", format!("expected scope_env, got {reason}"))?;
    step(2, "gm-dave -> g1/prod: 403 forbidden (scope_env)");

    ensure(!stack.store().get("u-2")?.banned, "no call should have reached the instance")?;
    let outcomes: Vec<String> = stack.audit_records()?.into_iter().map(|r| r.outcome).collect();
    ensure(outcomes == ["forbidden", "forbidden"], format!("audit outcomes {outcomes:?}"))?;
    step(3, "nothing was forwarded; both refusals are audited");
    Ok(())
}

#[cfg(test)]
mod tests {
    #[tokio::test(flavor = "multi_thread")]
    async fn scope_denial() {
        super::run_scenario().await.unwrap();
    }
}
