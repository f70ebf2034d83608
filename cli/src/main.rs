//! akl: command-line driver for the agent keepalive engine.
//!
//! # Usage
//!
//! ```text
//! akl replay session.json --settings keepalive.yaml --scenarios ./scenarios
//! akl scenarios --scenarios ./scenarios
//! akl detect --message "model step limit reached" --idle-ms 12000
//! ```
//!
//! Logging goes to stderr; set `RUST_LOG=debug` for per-tick detail.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_keepalive_core::data::scenarios::ScenarioSet;
use agent_keepalive_core::data::settings;
use agent_keepalive_core::infrastructure::replay::{decode_frames, ReplayFrame, ReplayUi};
use agent_keepalive_core::monitor::{DispatchLoop, TickOutcome, TickReport};
use agent_keepalive_core::scenario::{DetectContext, ScenarioDetector, TextOnlyProbe};
use agent_keepalive_core::tasks::TaskSnapshot;
use agent_keepalive_core::types::action::Action;
use agent_keepalive_core::types::config::Settings;

/// Keep a chat-driven coding agent moving.
#[derive(Parser, Debug)]
#[command(name = "akl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay recorded UI frames through the engine, one tick per frame
    Replay {
        /// JSON array of frames
        frames: PathBuf,

        /// Settings file (YAML)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Directory of custom scenario files
        #[arg(long)]
        scenarios: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the merged scenario library by priority
    Scenarios {
        /// Directory of custom scenario files
        #[arg(long)]
        scenarios: Option<PathBuf>,
    },

    /// Run scenario detection once against a message
    Detect {
        /// Latest agent message
        #[arg(long)]
        message: String,

        /// How long the agent has been idle
        #[arg(long, default_value_t = 0)]
        idle_ms: u64,

        /// Treat the agent as having worked earlier in the session
        #[arg(long)]
        ever_busy: bool,

        /// Settings file (YAML)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Directory of custom scenario files
        #[arg(long)]
        scenarios: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Replay {
            frames,
            settings,
            scenarios,
            json,
        } => cmd_replay(&frames, settings.as_deref(), scenarios.as_deref(), json),
        Commands::Scenarios { scenarios } => cmd_scenarios(scenarios.as_deref()),
        Commands::Detect {
            message,
            idle_ms,
            ever_busy,
            settings,
            scenarios,
        } => cmd_detect(&message, idle_ms, ever_busy, settings.as_deref(), scenarios.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(p) => settings::load(p).with_context(|| format!("loading settings {}", p.display())),
        None => Ok(settings::default_settings()),
    }
}

fn load_scenarios(dir: Option<&Path>) -> Result<ScenarioSet> {
    ScenarioSet::load(dir).context("loading scenarios")
}

fn read_frames(path: &Path) -> Result<Vec<ReplayFrame>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    decode_frames(&json).with_context(|| format!("decoding frames in {}", path.display()))
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DeferredRecord {
    at_ms: u64,
    action: Action,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    ticks: Vec<TickReport>,
    deferred: Vec<DeferredRecord>,
    tasks: Vec<TaskSnapshot>,
}

fn replay(frames: &[ReplayFrame], engine: &mut DispatchLoop) -> ReplayOutput {
    let mut ui = ReplayUi::new();
    let mut ticks = Vec::with_capacity(frames.len());
    let mut deferred = Vec::new();
    for frame in frames {
        ui.apply(frame);
        for action in engine.pump_deferred(&mut ui, frame.at_ms) {
            deferred.push(DeferredRecord {
                at_ms: frame.at_ms,
                action,
            });
        }
        ticks.push(engine.tick(&mut ui, frame.at_ms));
    }
    ReplayOutput {
        ticks,
        deferred,
        tasks: engine.dump(),
    }
}

fn describe_outcome(outcome: &TickOutcome) -> String {
    match outcome {
        TickOutcome::Idle => "idle".into(),
        TickOutcome::Working => "working".into(),
        TickOutcome::SessionReset => "session reset".into(),
        TickOutcome::Interrupt { kind } => format!("interrupt {:?}", kind),
        TickOutcome::Dispatched { task_id, task_type } => {
            format!("dispatch {} ({})", task_id, task_type.label())
        }
        TickOutcome::TaskSkipped { task_id } => format!("skipped {}", task_id),
        TickOutcome::TaskIgnored { task_id } => format!("ignored {}", task_id),
        TickOutcome::Recovery {
            scenario_id,
            executed,
        } => {
            if *executed {
                format!("recovery {}", scenario_id)
            } else {
                format!("recovery {} (not executed)", scenario_id)
            }
        }
        TickOutcome::Throttled { scenario_id } => format!("throttled {}", scenario_id),
        TickOutcome::StallEscalation => "stall escalation".into(),
        TickOutcome::Backup => "backup continue".into(),
    }
}

fn format_tick(report: &TickReport) -> String {
    let mut line = format!(
        "{:>9} {:<5} {}",
        report.at_ms,
        if report.busy { "busy" } else { "idle" },
        describe_outcome(&report.outcome)
    );
    if let Some(action) = &report.action {
        line.push_str(" -> ");
        line.push_str(&action.describe());
    }
    line
}

fn cmd_replay(
    frames_path: &Path,
    settings_path: Option<&Path>,
    scenarios_dir: Option<&Path>,
    json: bool,
) -> Result<()> {
    let settings = load_settings(settings_path)?;
    let scenarios = load_scenarios(scenarios_dir)?;
    let frames = read_frames(frames_path)?;
    let mut engine = DispatchLoop::new(settings, scenarios).context("building engine")?;
    info!(frames = frames.len(), path = %frames_path.display(), "replaying");
    let output = replay(&frames, &mut engine);

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }
    for report in &output.ticks {
        println!("{}", format_tick(report));
    }
    for record in &output.deferred {
        println!("{:>9} deferred -> {}", record.at_ms, record.action.describe());
    }
    println!();
    print!("{}", engine.registry().render_table());
    Ok(())
}

// ---------------------------------------------------------------------------
// scenarios / detect
// ---------------------------------------------------------------------------

fn cmd_scenarios(scenarios_dir: Option<&Path>) -> Result<()> {
    let set = load_scenarios(scenarios_dir)?;
    println!("{:<26} {:>4}  {:<8} {:<16} {}", "ID", "PRIO", "ACTION", "GROUP", "SOURCE");
    for s in set.by_priority() {
        println!(
            "{:<26} {:>4}  {:<8} {:<16} {:?}{}",
            s.id,
            s.priority,
            s.action.kind(),
            s.group.as_deref().unwrap_or("-"),
            s.source,
            if s.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

fn cmd_detect(
    message: &str,
    idle_ms: u64,
    ever_busy: bool,
    settings_path: Option<&Path>,
    scenarios_dir: Option<&Path>,
) -> Result<()> {
    let settings = load_settings(settings_path)?;
    let mut detector = ScenarioDetector::new(load_scenarios(scenarios_dir)?, &settings);
    let ctx = DetectContext {
        last_message: message,
        chat_content: message,
        idle_ms,
        ever_busy,
    };
    match detector.detect(&ctx, &TextOnlyProbe, 0) {
        Some(m) => println!("{} (priority {}) via {}", m.scenario_id, m.priority, m.match_info),
        None => println!("no scenario matched"),
    }
    Ok(())
}
