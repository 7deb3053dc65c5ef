//! Scenario 4: Approval race
//!
//! Two producers decide the same pending wipe at once, one approving and one
//! rejecting. Exactly one decision wins with `200`; the other gets `409
//! not_pending`, and the stored state is the winner's.

use reqwest::{Method, StatusCode};
use serde_json::json;

use pitboss_contracts::error::PitbossResult;

use super::two_person_rule::request_wipe;
use super::{ensure, error_body, header, json_body, send, step};
use crate::stack::{Stack, StackOptions};

pub async fn run_scenario() -> PitbossResult<()> {
    header("Scenario 4: Approval race");
    let stack = Stack::start(StackOptions::default()).await?;
    let result = run(&stack).await;
    stack.shutdown().await;
    result
}

async fn run(stack: &Stack) -> PitbossResult<()> {
    let approval_id = request_wipe(stack, "u-6").await?;
    step(1, &format!("pending wipe of u-6: {approval_id}"));

    let approve = send(stack.api("producer-bob", Method::POST, &format!("/api/approvals/{approval_id}/approve"))?);
    let reject = send(
        stack
            .api("producer-carol", Method::POST, &format!("/api/approvals/{approval_id}/reject"))?
            .json(&json!({ "reason": "not enough evidence" })),
    );
    let (approved, rejected) = tokio::join!(approve, reject);
    let (approved, rejected) = (approved?, rejected?);
    let (a, r) = (approved.status(), rejected.status());
    step(2, &format!("producer-bob approve -> {a}, producer-carol reject -> {r}"));

    let (winner, loser) = match (a, r) {
        (StatusCode::OK, StatusCode::CONFLICT) => ("approved", rejected),
        (StatusCode::CONFLICT, StatusCode::OK) => ("rejected", approved),
        other => return ensure(false, format!("exactly one decision should win, got {other:?}")),
    };
    let body = error_body(loser).await?;
    ensure(body.code == "not_pending", format!("loser should see not_pending, got {}", body.code))?;
    step(3, &format!("{winner} won; the other decision got 409 not_pending"));

    let response = send(stack.api("producer-bob", Method::GET, &format!("/api/approvals/{approval_id}"))?).await?;
    let view = json_body(response).await?;
    ensure(view["state"] == winner, format!("stored state should be {winner}, is {}", view["state"]))?;

    let wiped = stack.store().get("u-6")?.level == 1;
    ensure(wiped == (winner == "approved"), "the wipe runs exactly when the approval wins")?;
    step(4, &format!("stored state is {winner}; u-6 wiped: {wiped}"));
    Ok(())
}
