#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use repairbus::{
    handler_fn, BusConfig, InMemoryConversationStore, Message, MessageBus, MessageHandler,
    MessageType, PublishOptions, SubscribeOptions, SubscriptionFilters, TypeSelection,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "repairbus")]
#[command(version)]
#[command(about = "Reliable in-process message bus for code-repair agents.", long_about = None)]
struct Cli {
    /// Path to a config.toml (defaults to the per-user config, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,

    /// Print the JSON Schema of the config file
    Schema,

    /// Run a scripted repair round among in-process agents and print metrics
    Simulate {
        /// Number of bug reports to push through the pipeline
        #[arg(long, default_value_t = 3)]
        rounds: usize,

        /// Make this agent fail every delivery (triage, diagnoser, fixer, verifier)
        #[arg(long)]
        failing_agent: Option<String>,

        /// Bound every handler call to this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Schema output must stay machine-readable, so it skips config and logging.
    if let Commands::Schema = cli.command {
        let schema = BusConfig::json_schema()?;
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = BusConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Schema => Ok(()),
        Commands::Simulate {
            rounds,
            failing_agent,
            timeout_ms,
        } => simulate(config, rounds, failing_agent.as_deref(), timeout_ms),
    }
}

/// One pipeline stage: react to an incoming message by publishing the next one.
fn stage<F>(bus: &MessageBus, agent: &'static str, failing: bool, next: F) -> impl MessageHandler
where
    F: Fn(&Message) -> Message + Send + Sync + 'static,
{
    let bus = bus.clone();
    handler_fn(move |msg| {
        if failing {
            anyhow::bail!("{agent} is unavailable");
        }
        let mut follow_up = next(msg).with_parent(msg.id.clone());
        follow_up.conversation_id = msg.conversation_id.clone();
        let outcome = bus.publish(follow_up, PublishOptions::default());
        if !outcome.success {
            tracing::debug!(
                agent,
                error = ?outcome.error,
                "Follow-up publish was not delivered"
            );
        }
        Ok(())
    })
}

fn simulate(
    config: BusConfig,
    rounds: usize,
    failing_agent: Option<&str>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let store = Arc::new(InMemoryConversationStore::new());
    let bus = MessageBus::builder()
        .config(config)
        .conversation_store(store.clone())
        .build()?;

    let mut options = SubscribeOptions::default();
    if let Some(ms) = timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    let fails = |agent: &str| failing_agent == Some(agent);

    bus.subscribe(
        "triage",
        MessageType::BugReport,
        stage(&bus, "triage", fails("triage"), |report| {
            Message::direct(
                MessageType::TaskAssignment,
                "triage",
                "diagnoser",
                json!({ "task": "diagnose", "report": report.content }),
            )
        }),
        options.clone(),
    )?;

    bus.subscribe(
        "diagnoser",
        MessageType::TaskAssignment,
        stage(&bus, "diagnoser", fails("diagnoser"), |task| {
            Message::new(
                MessageType::Diagnosis,
                "diagnoser",
                json!({
                    "file": task.content["report"]["file"],
                    "cause": "off-by-one in loop bound",
                }),
            )
            .with_topic("repair")
            .with_confidence(0.82)
        }),
        options.clone(),
    )?;

    bus.subscribe(
        "fixer",
        MessageType::Diagnosis,
        stage(&bus, "fixer", fails("fixer"), |diagnosis| {
            Message::direct(
                MessageType::FixProposal,
                "fixer",
                "verifier",
                json!({ "file": diagnosis.content["file"], "patch": "- i <= n\n+ i < n" }),
            )
            .with_confidence(0.74)
        }),
        options.clone().with_filters(
            SubscriptionFilters::default()
                .with_topic("repair")
                .with_min_confidence(0.5)
                .with_required_keys(["file", "cause"]),
        ),
    )?;

    bus.subscribe(
        "verifier",
        MessageType::FixProposal,
        stage(&bus, "verifier", fails("verifier"), |proposal| {
            Message::new(
                MessageType::TestResult,
                "verifier",
                json!({ "file": proposal.content["file"], "passed": true }),
            )
        }),
        options.clone(),
    )?;

    let results = Arc::new(parking_lot::Mutex::new(0_usize));
    let counter = Arc::clone(&results);
    bus.subscribe(
        "orchestrator",
        TypeSelection::one(MessageType::TestResult),
        handler_fn(move |_| {
            *counter.lock() += 1;
            Ok(())
        }),
        SubscribeOptions::default(),
    )?;

    for round in 0..rounds {
        let report = Message::direct(
            MessageType::BugReport,
            "orchestrator",
            "triage",
            json!({ "file": format!("src/module_{round}.rs"), "symptom": "panic on empty input" }),
        )
        .with_conversation(format!("bug-{round}"));
        let outcome = bus.publish(report, PublishOptions::default());
        info!(
            round,
            success = outcome.success,
            error = ?outcome.error,
            "Bug report published"
        );
    }

    info!(
        verified = *results.lock(),
        rounds,
        conversation_entries = store.len(),
        "Simulation finished"
    );
    for agent in bus.subscribed_agents() {
        if let Some(snapshot) = bus.circuit_snapshot(&agent) {
            info!(
                agent = %agent,
                state = ?snapshot.state,
                failures = snapshot.consecutive_failures,
                "Circuit breaker state"
            );
        }
    }

    let metrics = bus.performance_metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    // Handlers hold bus handles; clearing the registry releases them.
    bus.shutdown();
    Ok(())
}
