//! Report command for reading stored daily statistics.
//!
//! Reads go through [`StatsSelector`], so the report shows what was last
//! aggregated. `--refresh` re-aggregates the range first.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use serde::Serialize;

use st_core::{DailyStat, SubjectTotals};
use st_db::{Database, StatsSelector};

use crate::Config;
use crate::commands::aggregate::describe;
use crate::commands::util::{format_duration, parse_date};

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// First day to include (defaults to six days before `--to`).
    #[arg(long)]
    pub from: Option<String>,

    /// Last day to include (defaults to today).
    #[arg(long)]
    pub to: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,

    /// Re-aggregate the range before reading it.
    #[arg(long)]
    pub refresh: bool,
}

/// Totals over a report range.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RangeTotals {
    pub total_seconds: i64,
    pub paused_seconds: i64,
    pub points: i64,
    pub sessions_count: i64,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub days: Vec<DailyStat>,
    pub totals: RangeTotals,
    pub subjects: BTreeMap<String, SubjectTotals>,
}

impl Report {
    fn new(from: NaiveDate, to: NaiveDate, days: Vec<DailyStat>) -> Self {
        let mut totals = RangeTotals::default();
        let mut subjects: BTreeMap<String, SubjectTotals> = BTreeMap::new();
        for day in &days {
            totals.total_seconds += day.total_seconds;
            totals.paused_seconds += day.paused_seconds;
            totals.points += day.points;
            totals.sessions_count += day.sessions_count;
            for (subject, day_totals) in &day.subjects {
                let entry = subjects.entry(subject.clone()).or_default();
                entry.total_seconds += day_totals.total_seconds;
                entry.points += day_totals.points;
                entry.sessions_count += day_totals.sessions_count;
            }
        }
        Self {
            from,
            to,
            days,
            totals,
            subjects,
        }
    }
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    config: &Config,
    args: &ReportArgs,
    now: DateTime<Utc>,
) -> Result<Report> {
    let days = config
        .day_boundary()
        .context("invalid study day settings")?;
    let to = parse_date(args.to.as_deref().unwrap_or("today"), &days, now)?;
    let from = match &args.from {
        Some(from) => parse_date(from, &days, now)?,
        None => to - chrono::Duration::days(6),
    };
    if from > to {
        bail!("range start {from} is after its end {to}");
    }

    let mut selector = StatsSelector::new(config.stats_cache_ttl());
    if args.refresh {
        selector
            .refresh_range(db, from, to)
            .with_context(|| format!("failed to aggregate {from}..{to}"))?;
    }
    let stats = selector.daily_range(db, from, to)?;
    let report = Report::new(from, to, stats);

    if args.json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&report)?)?;
    } else {
        write_text(writer, &report)?;
    }
    Ok(report)
}

fn write_text<W: Write>(writer: &mut W, report: &Report) -> Result<()> {
    writeln!(writer, "Study report {} to {}", report.from, report.to)?;
    if report.days.is_empty() {
        writeln!(writer, "No statistics stored for this range.")?;
        return Ok(());
    }
    for day in &report.days {
        writeln!(writer, "{}", describe(day))?;
    }
    writeln!(
        writer,
        "Total: {} over {} sessions, {} points",
        format_duration(report.totals.total_seconds),
        report.totals.sessions_count,
        report.totals.points
    )?;
    writeln!(writer, "Subjects:")?;
    for (subject, totals) in &report.subjects {
        writeln!(
            writer,
            "- {subject}: {} ({} sessions, {} points)",
            format_duration(totals.total_seconds),
            totals.sessions_count,
            totals.points
        )?;
    }
    Ok(())
}
