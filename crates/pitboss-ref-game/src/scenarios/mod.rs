//! Reference dispatch scenarios.
//!
//! Each scenario starts its own `Stack`, drives it through the admin API
//! exactly as an operator console would, prints what it observes, and fails
//! with an error when an observation differs from the expected one.

pub mod approval_race;
pub mod heartbeat_expiry;
pub mod invoke_round_trip;
pub mod job_cancel_restart;
pub mod scope_denial;
pub mod two_person_rule;

use reqwest::{Response, StatusCode};
use serde_json::Value;

use pitboss_contracts::error::{ErrorBody, PitbossError, PitbossResult};

/// Run every scenario in order.
pub async fn run_all() -> PitbossResult<()> {
    invoke_round_trip::run_scenario().await?;
    scope_denial::run_scenario().await?;
    two_person_rule::run_scenario().await?;
    approval_race::run_scenario().await?;
    job_cancel_restart::run_scenario().await?;
    heartbeat_expiry::run_scenario().await?;
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

pub(crate) fn ensure(condition: bool, what: impl Into<String>) -> PitbossResult<()> {
    if condition {
        Ok(())
    } else {
        Err(PitbossError::internal(format!("unexpected outcome: {}", what.into())))
    }
}

pub(crate) async fn send(request: reqwest::RequestBuilder) -> PitbossResult<Response> {
    request
        .send()
        .await
        .map_err(|e| PitbossError::UpstreamUnavailable { reason: e.to_string() })
}

pub(crate) fn ensure_status(response: &Response, expected: StatusCode) -> PitbossResult<()> {
    ensure(
        response.status() == expected,
        format!("{} answered {}, expected {}", response.url().path(), response.status(), expected),
    )
}

pub(crate) async fn json_body(response: Response) -> PitbossResult<Value> {
    response
        .json()
        .await
        .map_err(|e| PitbossError::internal(format!("response is not JSON: {e}")))
}

pub(crate) async fn error_body(response: Response) -> PitbossResult<ErrorBody> {
    response
        .json()
        .await
        .map_err(|e| PitbossError::internal(format!("response is not an error body: {e}")))
}

pub(crate) fn step(n: u32, text: &str) {
    println!("  [{n}] {text}");
}

pub(crate) fn header(title: &str) {
    println!();
    println!("── {title} ──");
}
