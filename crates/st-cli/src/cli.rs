//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::aggregate::AggregateArgs;
use crate::commands::attempt::AttemptAction;
use crate::commands::import::ImportArgs;
use crate::commands::report::ReportArgs;

/// Offline-first study tracker.
///
/// Records study attempts as an append-only event log, syncs it with a remote
/// replica, and derives sessions and daily statistics from it.
#[derive(Debug, Parser)]
#[command(name = "st", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create and drive attempts.
    #[command(subcommand)]
    Attempt(AttemptAction),

    /// Exchange events with the configured remote.
    Sync,

    /// Import completion logs as JSONL from stdin.
    Import(ImportArgs),

    /// Create missing sessions from completion facts.
    Backfill,

    /// Rename legacy session ids to their canonical form.
    Migrate,

    /// Recompute stored daily statistics.
    Aggregate(AggregateArgs),

    /// Show stored daily statistics for a date range.
    Report(ReportArgs),

    /// Show active attempts and sync state.
    Status,
}
