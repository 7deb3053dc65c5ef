//! The reference game's function handlers.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use pitboss_contracts::{
    descriptor::FunctionDescriptor,
    error::{PitbossError, PitbossResult},
};
use pitboss_sdk::{invoke_fn, job_fn, CallContext, InstanceBuilder, JobContext};
use tracing::info;

use crate::players::PlayerStore;
use crate::descriptors;

#[derive(Debug, Deserialize)]
struct BanArgs {
    player_id: String,
    reason: String,
    #[serde(default)]
    duration_hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WipeArgs {
    player_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExportArgs {
    #[serde(default)]
    min_level: u32,
    /// Pause between rows, to make progress observable.
    #[serde(default)]
    step_delay_ms: u64,
}

fn parse<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> PitbossResult<T> {
    serde_json::from_slice(payload).map_err(|e| PitbossError::invalid("payload", e.to_string()))
}

fn encode(value: serde_json::Value) -> PitbossResult<Vec<u8>> {
    serde_json::to_vec(&value).map_err(|e| PitbossError::internal(format!("failed to encode result: {e}")))
}

pub async fn ban(store: &PlayerStore, call: &CallContext, payload: &[u8]) -> PitbossResult<Vec<u8>> {
    let args: BanArgs = parse(payload)?;
    let player = store.ban(&args.player_id, &args.reason, args.duration_hours)?;
    info!(player_id = %player.id, by = call.caller().unwrap_or("-"), "player banned");
    encode(json!({ "player_id": player.id, "banned": true, "duration_hours": player.ban_hours }))
}

pub async fn wipe(store: &PlayerStore, call: &CallContext, payload: &[u8]) -> PitbossResult<Vec<u8>> {
    let args: WipeArgs = parse(payload)?;
    let player = store.wipe(&args.player_id)?;
    info!(player_id = %player.id, by = call.caller().unwrap_or("-"), "player wiped");
    encode(json!({ "player_id": player.id, "wiped": true, "level": player.level, "coins": player.coins }))
}

/// CSV of every player at or above `min_level`, one progress frame per row.
pub async fn export(store: &PlayerStore, job: &JobContext, payload: &[u8]) -> PitbossResult<Vec<u8>> {
    let args: ExportArgs = if payload.is_empty() { ExportArgs::default() } else { parse(payload)? };
    let rows: Vec<_> = store.all().into_iter().filter(|p| p.level >= args.min_level).collect();
    let mut csv = String::from("id,name,level,coins,banned\n");
    let total = rows.len().max(1);
    for (i, p) in rows.iter().enumerate() {
        if job.is_cancelled() {
            return Err(PitbossError::Cancelled { reason: "export cancelled".to_string() });
        }
        csv.push_str(&format!("{},{},{},{},{}\n", p.id, p.name, p.level, p.coins, p.banned));
        let percent = ((i + 1) * 100 / total).min(99) as u8;
        job.progress(percent, format!("exported {}", p.id));
        if args.step_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.step_delay_ms)).await;
        }
    }
    Ok(csv.into_bytes())
}

/// An instance hosting every reference function over `store`.
pub fn instance(service_id: &str, store: Arc<PlayerStore>) -> PitbossResult<InstanceBuilder> {
    let mut builder = InstanceBuilder::new(service_id);
    for descriptor in descriptors::bundled()? {
        builder = attach(builder, descriptor, Arc::clone(&store))?;
    }
    Ok(builder)
}

fn attach(builder: InstanceBuilder, descriptor: FunctionDescriptor, store: Arc<PlayerStore>) -> PitbossResult<InstanceBuilder> {
    let builder = match descriptor.id.as_str() {
        "player.ban" => builder.invoke(
            descriptor,
            invoke_fn(move |call: CallContext, payload: Vec<u8>| {
                let store = Arc::clone(&store);
                async move { ban(&store, &call, &payload).await }
            }),
        ),
        "player.wipe" => builder.invoke(
            descriptor,
            invoke_fn(move |call: CallContext, payload: Vec<u8>| {
                let store = Arc::clone(&store);
                async move { wipe(&store, &call, &payload).await }
            }),
        ),
        "reports.export" => builder.job(
            descriptor,
            job_fn(move |job: JobContext, payload: Vec<u8>| {
                let store = Arc::clone(&store);
                async move { export(&store, &job, &payload).await }
            }),
        ),
        other => return Err(PitbossError::config(format!("no handler for bundled function '{other}'"))),
    };
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ban_reports_the_new_state() {
        let store = PlayerStore::seeded();
        let out = ban(&store, &CallContext::default(), br#"{"player_id":"u-1","reason":"cheat","duration_hours":48}"#)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["banned"], true);
        assert_eq!(v["duration_hours"], 48);
        assert!(store.get("u-1").unwrap().banned);
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid() {
        let store = PlayerStore::seeded();
        let err = wipe(&store, &CallContext::default(), b"not json").await.unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn every_bundled_function_has_a_handler() {
        assert!(instance("ref-1", Arc::new(PlayerStore::seeded())).is_ok());
    }
}
