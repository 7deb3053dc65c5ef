//! Scenario 5: Job cancel after agent restart
//!
//! A report export streams progress frames to completion. A second, slow
//! export is started; agent `a1` then restarts and forgets its job index.
//! Cancelling by handle still routes to `a1`, which acknowledges the job id.

use reqwest::{Method, StatusCode};
use serde_json::json;

use pitboss_contracts::error::{PitbossError, PitbossResult};

use super::{ensure, ensure_status, header, json_body, send, step};
use crate::stack::{Stack, StackOptions};

pub async fn run_scenario() -> PitbossResult<()> {
    header("Scenario 5: Job cancel after agent restart");
    let mut stack = Stack::start(StackOptions::default()).await?;
    let result = run(&mut stack).await;
    stack.shutdown().await;
    result
}

async fn start_export(stack: &Stack, step_delay_ms: u64) -> PitbossResult<(String, String)> {
    let request = stack.dispatch(
        "gm-alice",
        "/api/jobs",
        "g1",
        "dev",
        "reports.export",
        json!({ "min_level": 10, "step_delay_ms": step_delay_ms }),
    )?;
    let response = send(request).await?;
    ensure_status(&response, StatusCode::OK)?;
    let started = json_body(response).await?;
    let field = |name: &str| {
        started[name]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PitbossError::internal(format!("job receipt has no {name}")))
    };
    Ok((field("job_handle")?, field("job_id")?))
}

/// Event names of a server-sent event body, in order.
fn event_names(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("event:"))
        .map(|name| name.trim().to_string())
        .collect()
}

async fn run(stack: &mut Stack) -> PitbossResult<()> {
    let (handle, _) = start_export(stack, 0).await?;
    let response = send(stack.api("gm-alice", Method::GET, &format!("/api/jobs/{handle}/stream"))?).await?;
    ensure_status(&response, StatusCode::OK)?;
    let body = response
        .text()
        .await
        .map_err(|e| PitbossError::internal(format!("stream ended badly: {e}")))?;
    let events = event_names(&body);
    let progress = events.iter().filter(|e| e.as_str() == "progress").count();
    ensure(events.last().map(String::as_str) == Some("done"), format!("stream should end with done, got {events:?}"))?;
    ensure(progress == 5, format!("five players are at level 10 or above, saw {progress} progress frames"))?;
    step(1, &format!("export {handle} streamed {progress} progress frames then done"));

    let (handle, job_id) = start_export(stack, 2_000).await?;
    ensure(handle == format!("a1:{job_id}"), format!("handle {handle} should name agent a1"))?;
    step(2, &format!("slow export started: {handle}"));

    stack.restart_agent("a1").await?;
    step(3, "agent a1 restarted with an empty job index");

    let response = send(stack.api("gm-alice", Method::DELETE, &format!("/api/jobs/{handle}?reason=operator"))?).await?;
    ensure_status(&response, StatusCode::OK)?;
    let ack = json_body(response).await?;
    ensure(ack["job_id"] == job_id.as_str(), format!("cancel should acknowledge {job_id}, got {ack}"))?;
    step(4, &format!("DELETE /api/jobs/{handle} -> 200 {{\"job_id\":\"{job_id}\"}}"));

    let cancels: Vec<_> = stack.audit_records()?.into_iter().filter(|r| r.action == "cancel_job").collect();
    ensure(cancels.len() == 1 && cancels[0].outcome == "ok", "the cancel should be audited as ok")?;
    Ok(())
}
