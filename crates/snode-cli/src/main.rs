//! snode-sim binary
//!
//! Runs a deterministic chain against the service node rules and reports
//! what happened. Logging is filtered by `RUST_LOG`.

use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use snode_cli::{SimConfig, SimStats, Simulation};
use snode_consensus::{QuorumType, RulesConfig};

const DEFAULTS: SimConfig = SimConfig::DEFAULT;

#[derive(Parser)]
#[command(name = "snode-sim")]
#[command(about = "Simulate a chain under the service node consensus rules", long_about = None)]
struct Args {
    /// Nodes registered in the first block
    #[arg(default_value_t = DEFAULTS.nodes)]
    nodes: u32,

    /// Blocks to apply
    #[arg(default_value_t = DEFAULTS.blocks)]
    blocks: u64,

    /// Every n-th node never votes (0 keeps all online)
    #[arg(long, default_value_t = DEFAULTS.offline_every)]
    offline_every: u32,

    /// Height of the first block
    #[arg(long, default_value_t = DEFAULTS.start_height)]
    start_height: u64,

    /// JSON rules file; falls back to SNODE_RULES_CONFIG, then mainnet defaults
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    stats: &'a SimStats,
    tip: Option<TipReport>,
    latest_checkpoint: Option<u64>,
}

#[derive(Serialize)]
struct TipReport {
    height: u64,
    nodes: usize,
    active: usize,
    swarms: usize,
    queued: usize,
    state_change_validators: Option<usize>,
    state_change_workers: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    snode_logging::init(snode_logging::DEFAULT_DIRECTIVES)?;

    let config = SimConfig {
        nodes: args.nodes,
        blocks: args.blocks,
        offline_every: args.offline_every,
        start_height: args.start_height,
    };
    let rules = match &args.rules {
        Some(path) => RulesConfig::from_json_file(path)?,
        None => RulesConfig::from_env()?,
    };
    tracing::info!(nettype = %rules.nettype, nodes = config.nodes, blocks = config.blocks, "Starting simulation");

    let mut sim = Simulation::new(rules, config)?;
    sim.run()?;
    let list = sim.list();

    let tip = list.snapshot().map(|snapshot| {
        let quorum = list.quorum(snapshot.height, QuorumType::StateChange);
        TipReport {
            height: snapshot.height,
            nodes: snapshot.len(),
            active: snapshot.active_count(),
            swarms: snapshot.swarms().swarm_count(),
            queued: snapshot.swarms().queue().len(),
            state_change_validators: quorum.as_ref().map(|q| q.validators.len()),
            state_change_workers: quorum.as_ref().map(|q| q.workers.len()),
        }
    });
    let report = Report {
        stats: sim.stats(),
        tip,
        latest_checkpoint: list.checkpoints().latest().map(|cp| cp.height),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}

fn print_text(report: &Report<'_>) {
    let stats = report.stats;
    println!("blocks applied:         {}", stats.blocks);
    println!("nodes registered:       {}", stats.registered);
    println!("quorums built:          {}", stats.quorums_built);
    println!("checkpoint votes cast:  {}", stats.checkpoint_votes);
    println!("checkpoints reached:    {}", stats.checkpoints);
    println!("state change votes:     {}", stats.state_change_votes);
    println!("state changes applied:  {}", stats.state_changes_applied);
    println!("state changes rejected: {}", stats.state_changes_rejected);
    println!("votes rejected:         {}", stats.rejected_votes);
    println!("swarms created:         {}", stats.swarms_created);

    if let Some(tip) = &report.tip {
        println!(
            "tip {}: {} nodes ({} active) in {} swarms, {} queued",
            tip.height, tip.nodes, tip.active, tip.swarms, tip.queued
        );
        match (tip.state_change_validators, tip.state_change_workers) {
            (Some(v), Some(w)) => println!("state change quorum: {v} validators, {w} workers"),
            _ => println!("state change quorum: none"),
        }
    }
    if let Some(height) = report.latest_checkpoint {
        println!("latest checkpoint: {height}");
    }
}
