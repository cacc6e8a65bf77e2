//! Backfill command for deriving sessions from completion facts.

use std::io::Write;

use anyhow::{Context, Result};

use st_db::{BackfillReport, Database};

use crate::Config;

pub fn run<W: Write>(writer: &mut W, db: &mut Database, config: &Config) -> Result<BackfillReport> {
    let days = config
        .day_boundary()
        .context("invalid study day settings")?;
    let report = db.backfill_sessions(&days).context("backfill failed")?;
    writeln!(
        writer,
        "Backfill: {} created, {} already present, {} skipped",
        report.created, report.already, report.skipped
    )?;
    Ok(report)
}
