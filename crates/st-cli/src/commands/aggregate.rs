//! Aggregate command for recomputing stored daily statistics.

use std::io::Write;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::Args;

use st_core::DailyStat;
use st_db::Database;

use crate::Config;
use crate::commands::util::{format_duration, parse_date};

#[derive(Debug, Args)]
pub struct AggregateArgs {
    /// Single study day to recompute (defaults to today).
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub day: Option<String>,

    /// First day of a range to recompute.
    #[arg(long, requires = "to")]
    pub from: Option<String>,

    /// Last day of a range to recompute.
    #[arg(long, requires = "from")]
    pub to: Option<String>,
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    config: &Config,
    args: &AggregateArgs,
    now: DateTime<Utc>,
) -> Result<Vec<DailyStat>> {
    let days = config
        .day_boundary()
        .context("invalid study day settings")?;
    let (start, end) = match (&args.from, &args.to) {
        (Some(from), Some(to)) => (parse_date(from, &days, now)?, parse_date(to, &days, now)?),
        (None, None) => {
            let day = parse_date(args.day.as_deref().unwrap_or("today"), &days, now)?;
            (day, day)
        }
        _ => bail!("--from and --to must be given together"),
    };
    if start > end {
        bail!("range start {start} is after its end {end}");
    }

    let stats = db
        .aggregate_range(start, end)
        .with_context(|| format!("failed to aggregate {start}..{end}"))?;
    for stat in &stats {
        writeln!(writer, "{}", describe(stat))?;
    }
    Ok(stats)
}

/// One-line summary of a day.
pub(crate) fn describe(stat: &DailyStat) -> String {
    format!(
        "{}: {} over {} sessions, {} points, {:.0}% focus",
        stat.date,
        format_duration(stat.total_seconds),
        stat.sessions_count,
        stat.points,
        stat.focus_score
    )
}
