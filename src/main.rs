use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use flowsync::config::FlowSyncConfig;

mod commands;

/// Three-way diff and merge for flow configurations
///
/// flowsync compares flow snapshots (JSON arrays of records with `id`,
/// `type`, optional `z` container, and `wires`) and reconciles a local edit
/// with a remote edit made against the same base.
///
/// TYPICAL USE:
///
///   # What did I change since the last deploy?
///   flowsync view deployed.json mine.json
///
///   # What conflicts with the server's copy?
///   flowsync reconcile deployed.json mine.json server.json
///
///   # Merge, choosing a side for every conflict
///   flowsync merge deployed.json mine.json server.json \
///       --resolve n1=local --resolve n7=remote --output merged.json
///
/// Unconflicted records resolve automatically: remote wins wherever the
/// remote side touched a record, local wins everywhere else.
#[derive(Parser)]
#[command(name = "flowsync")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(
    after_help = "See 'flowsync <command> --help' for more information on a specific command."
)]
struct Cli {
    /// Configuration file (registered types, flows file, codec strictness)
    #[arg(
        long,
        global = true,
        env = "FLOWSYNC_CONFIG",
        default_value = "flowsync.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what changed between two snapshots
    Diff(commands::DiffArgs),

    /// List conflicts and default resolutions for a three-way comparison
    Reconcile(commands::ReconcileArgs),

    /// Produce the merged snapshot
    ///
    /// Fails, listing the conflicts, unless every conflict has a --resolve.
    Merge(commands::MergeArgs),

    /// Print the sectioned diff table
    View(commands::ViewArgs),

    /// Reconcile a local snapshot against the flows file and deploy the merge
    ///
    /// The flows file (`[transport] flows_file`) plays the server. The post
    /// is refused if the file changes between fetch and write.
    Sync(commands::SyncArgs),
}

fn main() -> Result<()> {
    let _telemetry = flowsync::telemetry::init();
    let cli = Cli::parse();

    let config = FlowSyncConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Diff(ref args) => commands::run_diff(args),
        Commands::Reconcile(ref args) => commands::run_reconcile(args),
        Commands::Merge(ref args) => commands::run_merge(&config, args),
        Commands::View(ref args) => commands::run_view(&config, args),
        Commands::Sync(ref args) => commands::run_sync(&config, args),
    }
}
