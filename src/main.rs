//! statelane - reactive state machine driver
//!
//! Loads a machine definition, replays events through a machine and prints
//! every transition record.

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use statelane_core::{
    MachineConfig, MachineDefinition, Phase, ShutdownMode, StateMachine, Transition,
};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statelane")]
#[command(about = "Drive a reactive state machine from a definition file")]
#[command(version)]
struct Cli {
    /// Machine config file (YAML)
    #[arg(short, long, env = "STATELANE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a definition and print its graph
    Check {
        /// Definition file (.json, .yaml)
        definition: PathBuf,
    },

    /// Replay events through a machine and print transitions
    Run {
        /// Definition file (.json, .yaml)
        definition: PathBuf,

        /// File with one event per line (defaults to stdin)
        #[arg(short, long)]
        events: Option<PathBuf>,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct RecordLine<'a> {
    seq: u64,
    phase: Phase,
    state: &'a str,
    event: Option<&'a str>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { definition } => check(&definition),
        Commands::Run {
            definition,
            events,
            json,
        } => run(&definition, cli.config.as_deref(), events.as_deref(), json).await,
    }
}

fn check(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let def = MachineDefinition::from_file(path)?;
    let reachable = reachable_states(&def);

    println!(
        "{} {} (checksum: {})",
        "Valid".green(),
        def.name.cyan(),
        def.checksum
    );
    println!(
        "  {} states, {} transitions, initial [{}]",
        def.states().len(),
        def.transition_count(),
        def.initial
    );

    for state in def.states() {
        let edges: Vec<String> = def
            .events_from(state)
            .into_iter()
            .filter_map(|event| {
                def.get_transition(state, event)
                    .map(|to| format!("{} -> {}", event, to))
            })
            .collect();

        let marker = if reachable.contains(state.as_str()) {
            String::new()
        } else {
            format!(" {}", "(unreachable)".yellow())
        };

        if edges.is_empty() {
            println!("  [{}]{}", state.bold(), marker);
        } else {
            println!("  [{}]{}  {}", state.bold(), marker, edges.join(", "));
        }
    }

    Ok(())
}

/// States reachable from the initial state.
fn reachable_states(def: &MachineDefinition) -> HashSet<&str> {
    let mut seen = HashSet::from([def.initial.as_str()]);
    let mut queue = VecDeque::from([def.initial.as_str()]);

    while let Some(state) = queue.pop_front() {
        for event in def.events_from(state) {
            if let Some(to) = def.get_transition(state, event) {
                if seen.insert(to) {
                    queue.push_back(to);
                }
            }
        }
    }
    seen
}

/// Forwards every record into an unbounded channel.
///
/// Lane callbacks never drop records, so the printer can fall arbitrarily
/// far behind. The channel ends when the machine stops.
fn forward_records(
    machine: &StateMachine<String>,
) -> mpsc::UnboundedReceiver<Transition<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    machine.observe(move |record| {
        // The receiver only goes away if the printer stopped early.
        let _ = tx.send(record.clone());
    });
    rx
}

/// Accepts one event per line until the input ends or the user interrupts.
/// Returns the number of events accepted.
async fn replay<R>(machine: &StateMachine<String>, reader: R) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut accepted = 0u64;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let event = line.trim();
                if event.is_empty() || event.starts_with('#') {
                    continue;
                }
                machine.accept(event.to_string());
                accepted += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received interrupt, stopping machine...");
                machine.shutdown(ShutdownMode::Immediate);
                break;
            }
        }
    }
    Ok(accepted)
}

async fn run(
    path: &Path,
    config_path: Option<&Path>,
    events: Option<&Path>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let def = MachineDefinition::from_file(path)?;
    let config = MachineConfig::load(config_path, &def.name)?;
    let (graph, initial) = def.build();

    let names: Vec<String> = graph.iter().map(|s| s.name().to_string()).collect();
    let machine = StateMachine::with_config(graph, initial, config)?;

    let mut records = forward_records(&machine);
    let printer = tokio::spawn(async move {
        let mut transitions = 0u64;
        while let Some(record) = records.recv().await {
            if record.phase == Phase::Entering {
                transitions += 1;
            }
            print_record(&record, &names, json);
        }
        transitions
    });

    let accepted = match events {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            replay(&machine, BufReader::new(file)).await?
        }
        None => replay(&machine, BufReader::new(tokio::io::stdin())).await?,
    };

    machine.shutdown(ShutdownMode::Graceful);
    let transitions = printer.await?;
    machine.closed().await;

    if !json {
        println!(
            "{} {} events, {} transitions, final state [{}]",
            "Done:".bold(),
            accepted,
            transitions,
            machine.state_name().cyan()
        );
    }
    Ok(())
}

fn print_record(record: &Transition<String>, names: &[String], json: bool) {
    let state = names
        .get(record.state.index())
        .map(String::as_str)
        .unwrap_or("?");
    let event = record.event.as_deref();

    if json {
        let line = RecordLine {
            seq: record.seq,
            phase: record.phase,
            state,
            event,
        };
        match serde_json::to_string(&line) {
            Ok(text) => println!("{}", text),
            Err(e) => tracing::error!("Failed to encode record {}: {}", record.seq, e),
        }
        return;
    }

    let phase = match record.phase {
        Phase::Starting => record.phase.as_str().normal(),
        Phase::Exiting => record.phase.as_str().yellow(),
        Phase::Entering => record.phase.as_str().green(),
    };
    println!(
        "{:>5} {:<8} [{}] ({})",
        record.seq,
        phase,
        state.cyan(),
        event.unwrap_or("-")
    );
}
