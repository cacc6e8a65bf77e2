//! Migrate command for renaming legacy session ids.

use std::io::Write;

use anyhow::{Context, Result};

use st_db::{Database, MigrationReport};

pub fn run<W: Write>(writer: &mut W, db: &mut Database) -> Result<MigrationReport> {
    let report = db
        .migrate_session_ids()
        .context("session id migration failed")?;
    writeln!(
        writer,
        "Migrated {} session ids ({} duplicates removed)",
        report.migrated, report.collapsed
    )?;
    Ok(report)
}
