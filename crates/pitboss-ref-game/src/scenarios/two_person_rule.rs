//! Scenario 3: Two-person rule
//!
//! `player.wipe` is gated behind a second operator. A game master's wipe is
//! parked as a pending approval (`202`) without reaching the instance, and
//! the pending list shows it with the sensitive `reason` masked.

use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use pitboss_contracts::error::{PitbossError, PitbossResult};
use pitboss_sdk::new_idempotency_key;

use super::{ensure, ensure_status, header, json_body, send, step};
use crate::stack::{Stack, StackOptions};

pub async fn run_scenario() -> PitbossResult<()> {
    header("Scenario 3: Two-person rule pending");
    let stack = Stack::start(StackOptions::default()).await?;
    let result = run(&stack).await;
    stack.shutdown().await;
    result
}

/// Request a wipe of `player_id` as gm-alice; returns the approval id.
pub(crate) async fn request_wipe(stack: &Stack, player_id: &str) -> PitbossResult<String> {
    let request = stack
        .dispatch("gm-alice", "/api/invoke", "g1", "dev", "player.wipe", json!({ "player_id": player_id, "reason": "chargeback fraud" }))?
        .header("x-idempotency-key", new_idempotency_key());
    let response = send(request).await?;
    ensure_status(&response, StatusCode::ACCEPTED)?;
    let receipt = json_body(response).await?;
    ensure(receipt["state"] == "pending", "receipt should be pending")?;
    receipt["approval_id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PitbossError::internal("receipt has no approval_id"))
}

async fn run(stack: &Stack) -> PitbossResult<()> {
    let approval_id = request_wipe(stack, "u-3").await?;
    step(1, &format!("gm-alice asked to wipe u-3 -> 202 pending ({approval_id})"));

    let player = stack.store().get("u-3")?;
    ensure(player.level == 63 && player.coins == 98_000, "u-3 must be untouched")?;
    step(2, "no dispatch happened; u-3 is untouched");

    let response = send(stack.api("producer-bob", Method::GET, "/api/approvals?state=pending")?).await?;
    ensure_status(&response, StatusCode::OK)?;
    let page = json_body(response).await?;
    let items = page["items"].as_array().cloned().unwrap_or_default();
    ensure(items.len() == 1, format!("expected one pending approval, found {}", items.len()))?;
    ensure(
        items[0]["id"] == approval_id.as_str() && items[0]["function_id"] == "player.wipe",
        "the pending approval should be the wipe",
    )?;
    step(3, "GET /api/approvals?state=pending lists exactly that approval");

    let response = send(stack.api("producer-bob", Method::GET, &format!("/api/approvals/{approval_id}"))?).await?;
    ensure_status(&response, StatusCode::OK)?;
    let view: Value = json_body(response).await?;
    ensure(view["payload_preview"]["reason"] == "[redacted]", "reason should be masked in the preview")?;
    ensure(view["payload_preview"]["player_id"] == "u-3", "player_id should be visible")?;
    step(4, "the preview shows player_id and masks reason");

    let pending = stack.audit_records()?.into_iter().filter(|r| r.outcome == "pending").count();
    ensure(pending == 1, "the parked call should be audited as pending")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #[tokio::test(flavor = "multi_thread")]
    async fn two_person_rule_parks_the_call() {
        super::run_scenario().await.unwrap();
    }
}
