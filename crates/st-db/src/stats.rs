//! Daily aggregation and cached statistics reads.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{OptionalExtension, Row, params};

use st_core::{Clock, DailyStat, SubjectTotals, SystemClock, TtlCache, summarize_day};

use crate::{Database, DbError, format_date, format_timestamp, parse_date};

/// Key prefix shared by every cached statistics read.
pub const STATS_CACHE_PREFIX: &str = "stats:";

impl Database {
    /// Recomputes and stores the stat for `date` from its sessions.
    pub fn aggregate_day(&mut self, date: NaiveDate) -> Result<DailyStat, DbError> {
        let sessions = self.sessions_on(date)?;
        let stat = summarize_day(date, &sessions);
        let subjects =
            serde_json::to_string(&stat.subjects).map_err(|err| DbError::InvalidRow {
                record_id: format_date(date),
                message: err.to_string(),
            })?;

        self.conn.execute(
            "
            INSERT INTO daily_stats
                (date, total_seconds, paused_seconds, points, sessions_count, focus_score,
                 subjects, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                total_seconds = excluded.total_seconds,
                paused_seconds = excluded.paused_seconds,
                points = excluded.points,
                sessions_count = excluded.sessions_count,
                focus_score = excluded.focus_score,
                subjects = excluded.subjects,
                updated_at = excluded.updated_at
            ",
            params![
                format_date(date),
                stat.total_seconds,
                stat.paused_seconds,
                stat.points,
                stat.sessions_count,
                stat.focus_score,
                subjects,
                format_timestamp(Utc::now()),
            ],
        )?;

        tracing::debug!(
            %date,
            sessions = stat.sessions_count,
            total_seconds = stat.total_seconds,
            "aggregated day"
        );
        Ok(stat)
    }

    /// Aggregates every day from `start` to `end` inclusive, empty days included.
    ///
    /// Returns nothing when `end` is before `start`.
    pub fn aggregate_range(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStat>, DbError> {
        let mut stats = Vec::new();
        let mut next = Some(start);
        while let Some(date) = next.filter(|date| *date <= end) {
            stats.push(self.aggregate_day(date)?);
            next = date.succ_opt();
        }
        Ok(stats)
    }

    /// The stored stat for `date`, if it has been aggregated.
    pub fn daily_stat(&self, date: NaiveDate) -> Result<Option<DailyStat>, DbError> {
        self.conn
            .query_row(
                &format!("{STAT_SELECT} WHERE date = ?"),
                [format_date(date)],
                StatRow::from_row,
            )
            .optional()?
            .map(StatRow::into_stat)
            .transpose()
    }

    /// Stored stats between `start` and `end` inclusive, oldest first.
    ///
    /// Days never aggregated are absent.
    pub fn daily_stats_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStat>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{STAT_SELECT} WHERE date >= ? AND date <= ? ORDER BY date ASC"
        ))?;
        let rows = stmt.query_map(
            params![format_date(start), format_date(end)],
            StatRow::from_row,
        )?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?.into_stat()?);
        }
        Ok(stats)
    }
}

const STAT_SELECT: &str = "
    SELECT date, total_seconds, paused_seconds, points, sessions_count, focus_score, subjects
    FROM daily_stats
";

struct StatRow {
    date: String,
    total_seconds: i64,
    paused_seconds: i64,
    points: i64,
    sessions_count: i64,
    focus_score: f64,
    subjects: String,
}

impl StatRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            date: row.get(0)?,
            total_seconds: row.get(1)?,
            paused_seconds: row.get(2)?,
            points: row.get(3)?,
            sessions_count: row.get(4)?,
            focus_score: row.get(5)?,
            subjects: row.get(6)?,
        })
    }

    fn into_stat(self) -> Result<DailyStat, DbError> {
        let subjects: BTreeMap<String, SubjectTotals> = serde_json::from_str(&self.subjects)
            .map_err(|err| DbError::InvalidRow {
                record_id: self.date.clone(),
                message: err.to_string(),
            })?;
        Ok(DailyStat {
            date: parse_date(&self.date, &self.date)?,
            total_seconds: self.total_seconds,
            paused_seconds: self.paused_seconds,
            points: self.points,
            sessions_count: self.sessions_count,
            focus_score: self.focus_score,
            subjects,
        })
    }
}

/// Read path for daily stats with a short-lived cache in front.
///
/// Writes go through [`refresh_day`](Self::refresh_day) or
/// [`refresh_range`](Self::refresh_range), which drop every cached stats read.
#[derive(Debug)]
pub struct StatsSelector<C = SystemClock> {
    cache: TtlCache<Vec<DailyStat>, C>,
}

impl StatsSelector<SystemClock> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: TtlCache::new(ttl),
        }
    }
}

impl<C: Clock> StatsSelector<C> {
    pub const fn with_cache(cache: TtlCache<Vec<DailyStat>, C>) -> Self {
        Self { cache }
    }

    /// Stored stats between `start` and `end`, served from cache while fresh.
    pub fn daily_range(
        &mut self,
        db: &Database,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStat>, DbError> {
        let key = format!("{STATS_CACHE_PREFIX}daily:{start}:{end}");
        if let Some(stats) = self.cache.get(&key) {
            tracing::trace!(%key, "stats cache hit");
            return Ok(stats.clone());
        }
        let stats = db.daily_stats_between(start, end)?;
        self.cache.set(key, stats.clone());
        Ok(stats)
    }

    /// Re-aggregates `date` and drops cached reads.
    pub fn refresh_day(&mut self, db: &mut Database, date: NaiveDate) -> Result<DailyStat, DbError> {
        let stat = db.aggregate_day(date)?;
        self.invalidate();
        Ok(stat)
    }

    /// Re-aggregates `start..=end` and drops cached reads.
    pub fn refresh_range(
        &mut self,
        db: &mut Database,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStat>, DbError> {
        let stats = db.aggregate_range(start, end)?;
        self.invalidate();
        Ok(stats)
    }

    /// Drops every cached stats read.
    pub fn invalidate(&mut self) -> usize {
        self.cache.invalidate_prefix(STATS_CACHE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::tests::log;
    use chrono::DateTime;
    use serde_json::json;
    use st_core::{DayBoundary, UNASSIGNED_SUBJECT};
    use std::cell::Cell;
    use std::rc::Rc;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn seeded() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        db.record_completion_log(&log(
            "L1",
            "2025-09-01T06:00:00Z",
            json!({"duration": 1200, "pausedDuration": 0, "points": 20}),
        ))
        .unwrap();
        db.record_completion_log(&log(
            "L2",
            "2025-09-01T10:00:00Z",
            json!({"duration": 600, "pausedDuration": 0, "points": 10}),
        ))
        .unwrap();
        db.backfill_sessions(&DayBoundary::default()).unwrap();
        db
    }

    #[test]
    #[expect(clippy::float_cmp, reason = "nothing paused gives exactly 100")]
    fn two_logs_aggregate_into_one_day() {
        let mut db = seeded();
        let stat = db.aggregate_day(date("2025-09-01")).unwrap();
        assert_eq!(stat.total_seconds, 1800);
        assert_eq!(stat.points, 30);
        assert_eq!(stat.sessions_count, 2);
        assert_eq!(stat.focus_score, 100.0);
        assert_eq!(stat.subjects[UNASSIGNED_SUBJECT].total_seconds, 1800);

        assert_eq!(db.daily_stat(date("2025-09-01")).unwrap(), Some(stat));
    }

    #[test]
    fn reaggregating_overwrites_the_stored_stat() {
        let mut db = seeded();
        db.aggregate_day(date("2025-09-01")).unwrap();
        db.record_completion_log(&log(
            "L3",
            "2025-09-01T12:00:00Z",
            json!({"duration": 300, "points": 5}),
        ))
        .unwrap();
        db.backfill_sessions(&DayBoundary::default()).unwrap();

        let stat = db.aggregate_day(date("2025-09-01")).unwrap();
        assert_eq!(stat.total_seconds, 2100);
        assert_eq!(stat.sessions_count, 3);
        assert_eq!(
            db.daily_stat(date("2025-09-01")).unwrap().unwrap().total_seconds,
            2100
        );
    }

    #[test]
    fn undone_sessions_still_count_towards_their_day() {
        let mut undone = log(
            "L9",
            "2025-09-01T06:00:00Z",
            json!({"duration": 900, "pausedDuration": 0, "points": 15}),
        );
        undone.is_undone = true;
        let mut db = Database::open_in_memory().unwrap();
        db.record_completion_log(&undone).unwrap();
        db.backfill_sessions(&DayBoundary::default()).unwrap();
        assert_eq!(db.sessions_on(date("2025-09-01")).unwrap().len(), 1);

        let stat = db.aggregate_day(date("2025-09-01")).unwrap();
        assert_eq!(stat.sessions_count, 1);
        assert_eq!(stat.total_seconds, 900);
        assert_eq!(stat.points, 15);
    }

    #[test]
    fn range_includes_empty_days() {
        let mut db = seeded();
        let stats = db
            .aggregate_range(date("2025-08-31"), date("2025-09-02"))
            .unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0], DailyStat::empty(date("2025-08-31")));
        assert_eq!(stats[1].total_seconds, 1800);
        assert_eq!(stats[2].sessions_count, 0);

        let stored = db
            .daily_stats_between(date("2025-09-01"), date("2025-09-30"))
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn range_ending_on_last_representable_day_terminates() {
        let mut db = seeded();
        let stats = db
            .aggregate_range(NaiveDate::MAX.pred_opt().unwrap(), NaiveDate::MAX)
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1], DailyStat::empty(NaiveDate::MAX));
    }

    #[test]
    fn reversed_range_is_empty() {
        let mut db = seeded();
        let stats = db
            .aggregate_range(date("2025-09-02"), date("2025-09-01"))
            .unwrap();
        assert!(stats.is_empty());
    }

    #[test]
    fn selector_serves_cached_reads_until_refresh() {
        let mut db = seeded();
        let now = Rc::new(Cell::new(0_i64));
        let handle = Rc::clone(&now);
        let clock = move || DateTime::from_timestamp_millis(handle.get()).unwrap();
        let mut selector =
            StatsSelector::with_cache(TtlCache::with_clock(Duration::seconds(30), clock));

        let day = date("2025-09-01");
        assert!(selector.daily_range(&db, day, day).unwrap().is_empty());

        // Written behind the selector's back: the cached empty read survives.
        db.aggregate_day(day).unwrap();
        assert!(selector.daily_range(&db, day, day).unwrap().is_empty());

        // Expiry exposes the write.
        now.set(30_001);
        assert_eq!(selector.daily_range(&db, day, day).unwrap().len(), 1);

        db.record_completion_log(&log(
            "L3",
            "2025-09-01T12:00:00Z",
            json!({"duration": 600, "points": 5}),
        ))
        .unwrap();
        db.backfill_sessions(&DayBoundary::default()).unwrap();
        let refreshed = selector.refresh_day(&mut db, day).unwrap();
        assert_eq!(refreshed.total_seconds, 2400);
        let read = selector.daily_range(&db, day, day).unwrap();
        assert_eq!(read[0].total_seconds, 2400);
    }

    #[test]
    fn refresh_range_drops_every_stats_key() {
        let mut db = seeded();
        let mut selector = StatsSelector::new(Duration::seconds(30));
        selector
            .daily_range(&db, date("2025-09-01"), date("2025-09-01"))
            .unwrap();
        selector
            .daily_range(&db, date("2025-09-01"), date("2025-09-07"))
            .unwrap();

        selector
            .refresh_range(&mut db, date("2025-09-01"), date("2025-09-02"))
            .unwrap();
        assert_eq!(selector.invalidate(), 0);
    }
}
