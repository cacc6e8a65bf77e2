//! Status command for showing active attempts and sync state.

use std::io::Write;

use anyhow::Result;
use chrono::SecondsFormat;

use st_db::Database;

use crate::Config;

pub fn run<W: Write>(writer: &mut W, db: &Database, config: &Config) -> Result<()> {
    let active = db.active_attempts()?;
    let unsynced = db.unsynced_count()?;
    let last_sync = db.last_sync_timestamp()?;

    writeln!(writer, "Study tracker status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(writer, "User: {}", config.user_id)?;
    writeln!(
        writer,
        "Remote: {}",
        config.remote_url.as_deref().unwrap_or("not configured")
    )?;
    writeln!(writer, "Unsynced events: {unsynced}")?;
    writeln!(
        writer,
        "Last sync: {}",
        last_sync.map_or_else(
            || "never".to_string(),
            |ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    )?;
    writeln!(writer, "Sessions: {}", db.session_count()?)?;

    if active.is_empty() {
        writeln!(writer, "No active attempts.")?;
        return Ok(());
    }

    writeln!(writer, "Active attempts:")?;
    for attempt in active {
        writeln!(
            writer,
            "- {} [{}] {}",
            attempt.id, attempt.status, attempt.entity_id
        )?;
    }

    Ok(())
}
