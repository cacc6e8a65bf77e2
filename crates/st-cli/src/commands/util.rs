//! Shared utilities for CLI commands.

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use st_core::{AttemptId, DayBoundary};

/// Parse a date argument as `YYYY-MM-DD`, `today` or `yesterday`.
///
/// The relative forms resolve to study days under `days`, so shortly after
/// midnight `today` still names the previous calendar date.
pub fn parse_date(s: &str, days: &DayBoundary, now: DateTime<Utc>) -> anyhow::Result<NaiveDate> {
    match s.trim() {
        "today" => Ok(days.study_date(now)),
        "yesterday" => Ok(days.study_date(now) - Duration::days(1)),
        other => NaiveDate::parse_from_str(other, "%Y-%m-%d").with_context(|| {
            format!("Invalid date: {other}. Use YYYY-MM-DD, 'today' or 'yesterday'")
        }),
    }
}

pub fn parse_attempt_id(s: &str) -> anyhow::Result<AttemptId> {
    AttemptId::new(s).context("invalid attempt id")
}

/// Formats seconds as `45s`, `25m` or `1h 05m`.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        return format!("{secs}s");
    }
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours == 0 {
        format!("{minutes}m")
    } else {
        format!("{hours}h {minutes:02}m")
    }
}
