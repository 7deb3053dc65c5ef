//! pitboss reference game demo CLI
//!
//! Runs one or all of the dispatch scenarios. Each scenario starts a real
//! Server, agent(s), and SDK instance on loopback ports inside this process
//! and drives them through the admin API.
//!
//! Usage:
//!   cargo run -p demo -- run-all
//!   cargo run -p demo -- invoke
//!   cargo run -p demo -- approval-race

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pitboss_contracts::error::PitbossResult;
use pitboss_ref_game::scenarios::{
    approval_race, heartbeat_expiry, invoke_round_trip, job_cancel_restart, run_all, scope_denial, two_person_rule,
};

// ── CLI definition ────────────────────────────────────────────────────────────

/// pitboss: function dispatch control plane for game backends.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "pitboss reference game demo",
    long_about = "Runs pitboss reference scenarios showing routing, tenant scopes,\n\
                  the two-person rule, job handles, and heartbeat expiry."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all six scenarios in sequence.
    RunAll,
    /// Scenario 1: registration to invoke round trip.
    Invoke,
    /// Scenario 2: a caller scoped to one game asks for another.
    ScopeDenial,
    /// Scenario 3: a wipe parked behind the two-person rule.
    TwoPersonRule,
    /// Scenario 4: concurrent approve and reject.
    ApprovalRace,
    /// Scenario 5: cancel a job by handle after its agent restarts.
    JobCancel,
    /// Scenario 6: silent agents drop out of routing.
    HeartbeatExpiry,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // RUST_LOG=debug shows every process's logs.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    print_banner();
    info!(command = ?cli.command, "running");

    match run(cli.command).await {
        Ok(()) => println!("\nAll selected scenarios completed successfully."),
        Err(e) => {
            eprintln!("Demo error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(command: Command) -> PitbossResult<()> {
    match command {
        Command::RunAll => run_all().await,
        Command::Invoke => invoke_round_trip::run_scenario().await,
        Command::ScopeDenial => scope_denial::run_scenario().await,
        Command::TwoPersonRule => two_person_rule::run_scenario().await,
        Command::ApprovalRace => approval_race::run_scenario().await,
        Command::JobCancel => job_cancel_restart::run_scenario().await,
        Command::HeartbeatExpiry => heartbeat_expiry::run_scenario().await,
    }
}

// ── Banner ────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("pitboss: function dispatch control plane");
    println!("Reference Game Demo");
    println!("========================================");
    println!();
    println!("Dispatch pipeline per call:");
    println!("  [1] Bearer token verified; HTTP rule must match the route");
    println!("  [2] Permission grant and tenant scope (game, env) checked");
    println!("  [3] Payload validated against the descriptor's params schema");
    println!("  [4] Two-person rule parks the call as a pending approval");
    println!("  [5] A live agent is picked and the call forwarded to an instance");
    println!("  [6] Outcome appended to the SHA-256 audit chain");
}
