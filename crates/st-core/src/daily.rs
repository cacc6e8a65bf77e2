//! Per-day statistics folded from session records.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::session::Session;

/// Subject bucket for sessions that don't name one.
pub const UNASSIGNED_SUBJECT: &str = "Unassigned";

/// Totals for one subject within a day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectTotals {
    pub total_seconds: i64,
    pub points: i64,
    pub sessions_count: i64,
}

/// Aggregate over one study day's sessions.
///
/// Always recomputed wholesale from the day's sessions, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub total_seconds: i64,
    pub paused_seconds: i64,
    pub points: i64,
    pub sessions_count: i64,
    /// Share of tracked time that was not paused, 0-100.
    pub focus_score: f64,
    #[serde(default)]
    pub subjects: BTreeMap<String, SubjectTotals>,
}

impl DailyStat {
    /// The stat for a day with no sessions.
    #[must_use]
    pub const fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_seconds: 0,
            paused_seconds: 0,
            points: 0,
            sessions_count: 0,
            focus_score: 100.0,
            subjects: BTreeMap::new(),
        }
    }

    /// Seconds that were not paused.
    #[must_use]
    pub fn productive_seconds(&self) -> i64 {
        (self.total_seconds - self.paused_seconds).max(0)
    }
}

/// Summarizes the sessions of `date`.
///
/// Sessions dated another day are left out. Undone sessions still count: the
/// stat mirrors every stored session of the day.
#[expect(
    clippy::cast_precision_loss,
    reason = "second counts stay well inside f64's exact integer range"
)]
pub fn summarize_day(date: NaiveDate, sessions: &[Session]) -> DailyStat {
    let mut stat = DailyStat::empty(date);

    for session in sessions
        .iter()
        .filter(|session| session.date == date)
    {
        stat.total_seconds += session.duration_secs;
        stat.paused_seconds += session.paused_secs;
        stat.points += session.points;
        stat.sessions_count += 1;

        let subject = session
            .subject
            .clone()
            .unwrap_or_else(|| UNASSIGNED_SUBJECT.to_string());
        let totals = stat.subjects.entry(subject).or_default();
        totals.total_seconds += session.duration_secs;
        totals.points += session.points;
        totals.sessions_count += 1;
    }

    if stat.total_seconds > 0 {
        stat.focus_score =
            stat.productive_seconds() as f64 / stat.total_seconds as f64 * 100.0;
    }
    stat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKind;
    use chrono::{DateTime, Utc};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn session(id: &str, day: &str, duration: i64, paused: i64, points: i64) -> Session {
        Session {
            id: id.to_string(),
            user_id: "u1".to_string(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            duration_secs: duration,
            paused_secs: paused,
            points,
            date: date(day),
            kind: SessionKind::Task,
            title: String::new(),
            subject: None,
            is_undone: false,
        }
    }

    #[test]
    #[expect(clippy::float_cmp, reason = "exact value expected when nothing is paused")]
    fn sums_two_unpaused_sessions() {
        let sessions = vec![
            session("s1", "2025-09-01", 1200, 0, 20),
            session("s2", "2025-09-01", 600, 0, 10),
        ];
        let stat = summarize_day(date("2025-09-01"), &sessions);
        assert_eq!(stat.total_seconds, 1800);
        assert_eq!(stat.sessions_count, 2);
        assert_eq!(stat.points, 30);
        assert_eq!(stat.focus_score, 100.0);
        assert_eq!(stat.subjects[UNASSIGNED_SUBJECT].sessions_count, 2);
    }

    #[test]
    fn focus_score_reflects_paused_share() {
        let mut algebra = session("s1", "2025-01-01", 3600, 600, 10);
        algebra.subject = Some("Math".into());
        let mut physics = session("s2", "2025-01-01", 1800, 0, 5);
        physics.subject = Some("Physics".into());

        let stat = summarize_day(date("2025-01-01"), &[algebra, physics]);
        assert_eq!(stat.total_seconds, 5400);
        assert_eq!(stat.paused_seconds, 600);
        assert!((stat.focus_score - (4800.0 / 5400.0 * 100.0)).abs() < 1e-9);
        assert_eq!(stat.subjects["Math"].total_seconds, 3600);
        assert_eq!(stat.subjects["Physics"].points, 5);
    }

    #[test]
    #[expect(clippy::float_cmp, reason = "empty days score exactly 100")]
    fn empty_day_is_zero_valued() {
        let stat = summarize_day(date("2025-01-02"), &[]);
        assert_eq!(stat, DailyStat::empty(date("2025-01-02")));
        assert_eq!(stat.focus_score, 100.0);
    }

    #[test]
    fn skips_other_days_but_keeps_undone_sessions() {
        let mut undone = session("s3", "2025-01-01", 999, 0, 9);
        undone.is_undone = true;
        let sessions = vec![
            session("s1", "2025-01-01", 60, 0, 1),
            session("s2", "2025-01-02", 120, 0, 2),
            undone,
        ];
        let stat = summarize_day(date("2025-01-01"), &sessions);
        assert_eq!(stat.total_seconds, 1059);
        assert_eq!(stat.points, 10);
        assert_eq!(stat.sessions_count, 2);
    }

    #[test]
    fn fully_paused_day_floors_at_zero() {
        let stat = summarize_day(
            date("2025-01-01"),
            &[session("s1", "2025-01-01", 100, 150, 0)],
        );
        assert!(stat.focus_score.abs() < f64::EPSILON);
    }
}
