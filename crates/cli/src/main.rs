use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use common::{ChainBehavior, KeyId, KeyOrigin, LedgerConfig};
use inbox::{ScriptReport, ScriptRunner};
use ledger::{Ledger, LedgerError};
use scope::{DiscardPolicy, PredictionContext};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyledger")]
#[command(about = "Client-side prediction key bookkeeping", long_about = None)]
struct Cli {
    /// Which keys a server acceptance resolves besides the key itself.
    #[arg(
        long,
        global = true,
        env = "KEYLEDGER_CHAIN_BEHAVIOR",
        default_value = "ancestors-only"
    )]
    chain_behavior: ChainBehavior,

    /// Drop fully resolved key trees after every top-level operation.
    #[arg(long, global = true, env = "KEYLEDGER_AUTO_RECLAIM")]
    auto_reclaim: bool,

    /// Log filter, e.g. `debug` or `ledger=debug,warn`.
    #[arg(long, global = true, env = "KEYLEDGER_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a JSON-lines op script and print the resulting ledger.
    Run {
        /// Script file, one op per line.
        script: PathBuf,
        /// Print a JSON snapshot instead of the state table.
        #[arg(long)]
        json: bool,
    },
    /// Replay one of the built-in prediction scenarios.
    Scenario {
        #[arg(value_enum)]
        which: Scenario,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Fan-out: reject one leaf, then accept its sibling.
    A,
    /// Chain: reject the middle, then try to accept the tail.
    B,
    /// Window with a silently dropped discard inside.
    C,
}

fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: .env: {}", e);
        }
    }

    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = LedgerConfig {
        chain_behavior: cli.chain_behavior,
        auto_reclaim: cli.auto_reclaim,
    };
    tracing::debug!(chain_behavior = %config.chain_behavior, auto_reclaim = config.auto_reclaim, "ledger config");

    match &cli.command {
        Commands::Run { script, json } => cmd_run(config, script, *json)?,
        Commands::Scenario { which } => cmd_scenario(config, *which)?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn cmd_run(config: LedgerConfig, script: &Path, json: bool) -> anyhow::Result<()> {
    let mut ledger = Ledger::with_config(config);
    let (report, labels) = {
        let mut runner = ScriptRunner::new(&mut ledger);
        let report = runner
            .run_file(script)
            .with_context(|| format!("failed to run script {}", script.display()))?;
        (report, runner.labels().clone())
    };

    if json {
        let out = serde_json::json!({
            "report": &report,
            "labels": &labels,
            "ledger": ledger.snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let names: BTreeMap<KeyId, String> = labels
        .into_iter()
        .map(|(label, key)| (key, label))
        .collect();
    print_report(&report);
    print_ledger(&ledger, &names);
    Ok(())
}

fn print_report(report: &ScriptReport) {
    println!("+------------------------------------------+");
    println!("| KEYLEDGER RUN                            |");
    println!("+------------------------------------------+");
    println!("| Applied        : {:>22} |", report.applied);
    println!("| Failed         : {:>22} |", report.failures.len());
    println!("| Skipped lines  : {:>22} |", report.skipped_lines);
    println!("+------------------------------------------+");

    if !report.failures.is_empty() {
        println!("\nFAILED STEPS:");
        for failure in &report.failures {
            println!("  line {} ({}) - {}", failure.line, failure.op, failure.error);
        }
    }
}

fn print_ledger(ledger: &Ledger, names: &BTreeMap<KeyId, String>) {
    let snapshot = ledger.snapshot();
    let (pending, accepted, rejected) = snapshot.counts();

    println!("\n+------------------------------------------+");
    println!("| LEDGER                                   |");
    println!("+------------------------------------------+");
    println!("| Pending        : {:>22} |", pending);
    println!("| Accepted       : {:>22} |", accepted);
    println!("| Rejected       : {:>22} |", rejected);
    println!("+------------------------------------------+");

    if snapshot.keys.is_empty() {
        println!("No keys held.");
        return;
    }

    let name = |key: KeyId| names.get(&key).cloned().unwrap_or_else(|| key.to_string());
    for key in &snapshot.keys {
        let base = key.base.map(name).unwrap_or_else(|| "-".to_string());
        let origin = match key.origin {
            KeyOrigin::LocalClient => "local",
            KeyOrigin::ServerInitiated => "server",
        };
        println!(
            "  {:<6} {:<12} base={:<12} {:<7} {}",
            key.id.to_string(),
            name(key.id),
            base,
            origin,
            key.state
        );
    }
}

// ---------------------------------------------------------------------------
// scenario
// ---------------------------------------------------------------------------

/// Result of replaying a scenario: the final ledger, key names, and the
/// outcome of the last confirmation.
struct ScenarioRun {
    ledger: Ledger,
    names: BTreeMap<KeyId, String>,
    outcome: Result<(), LedgerError>,
}

fn cmd_scenario(config: LedgerConfig, which: Scenario) -> anyhow::Result<()> {
    let run = match which {
        Scenario::A => scenario_fan_out(config)?,
        Scenario::B => scenario_contradiction(config)?,
        Scenario::C => scenario_silent_discard(config)?,
    };

    match &run.outcome {
        Ok(()) => println!("Outcome: ok"),
        Err(e) => println!("Outcome: {}", e),
    }
    print_ledger(&run.ledger, &run.names);
    Ok(())
}

fn named(keys: &[KeyId]) -> BTreeMap<KeyId, String> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| (*key, format!("k{}", i)))
        .collect()
}

/// `k0 <- k1 <- {k2, k3}`: reject k3, then accept k2.
fn scenario_fan_out(config: LedgerConfig) -> anyhow::Result<ScenarioRun> {
    let mut ledger = Ledger::with_config(config);
    let k0 = ledger.allocate_root();
    let k1 = ledger.allocate_dependent(k0)?;
    let k2 = ledger.allocate_dependent(k1)?;
    let k3 = ledger.allocate_dependent(k1)?;

    ledger.reject(k3)?;
    let outcome = ledger.catch_up_to(k2);

    Ok(ScenarioRun {
        names: named(&[k0, k1, k2, k3]),
        ledger,
        outcome,
    })
}

/// `k0 <- k1 <- k2 <- k3`: reject k1, then accept k3 on top of it.
fn scenario_contradiction(config: LedgerConfig) -> anyhow::Result<ScenarioRun> {
    let mut ledger = Ledger::with_config(config);
    let mut keys = vec![ledger.allocate_root()];
    for _ in 0..3 {
        let base = keys[keys.len() - 1];
        keys.push(ledger.allocate_dependent(base)?);
    }

    ledger.reject(keys[1])?;
    let outcome = ledger.catch_up_to(keys[3]);

    Ok(ScenarioRun {
        names: named(&keys),
        ledger,
        outcome,
    })
}

/// A window key `k0` with a silently dropped discard opened inside it.
fn scenario_silent_discard(config: LedgerConfig) -> anyhow::Result<ScenarioRun> {
    let mut ledger = Ledger::with_config(config);
    let (window_key, outcome) = {
        let mut ctx = PredictionContext::new(&mut ledger, "scenario-c");
        let mut window = ctx.open_window()?;
        let window_key = window.key();
        let discard = window.open_discard(DiscardPolicy::SilentlyDrop)?;
        tracing::info!(window = %window_key, discard = %discard.key(), "discard opened");
        (window_key, discard.finish())
    };

    Ok(ScenarioRun {
        names: named(&[window_key]),
        ledger,
        outcome,
    })
}
