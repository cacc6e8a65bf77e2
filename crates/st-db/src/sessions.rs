//! Completion facts and the session records derived from them.

use std::collections::HashSet;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;

use st_core::{
    CompletionFact, DayBoundary, SESSION_ID_PREFIX, Session, SessionKind,
    build_session_from_completion_fact, session_id_for,
};

use crate::{
    Database, DbError, EventRow, format_date, format_timestamp, parse_date, parse_timestamp,
};

/// Ids checked per existence query during backfill.
const BACKFILL_CHUNK_SIZE: usize = 200;

/// Result of [`Database::backfill_sessions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Sessions written by this run.
    pub created: usize,
    /// Facts whose session already existed.
    pub already: usize,
    /// Facts that could not be turned into a session.
    pub skipped: usize,
}

/// Result of [`Database::migrate_session_ids`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Legacy ids renamed to their canonical form.
    pub migrated: usize,
    /// Legacy rows dropped because the canonical row already existed.
    pub collapsed: usize,
}

impl Database {
    /// Stores a completion log. Returns `false` if the id was already stored.
    pub fn record_completion_log(&self, log: &CompletionFact) -> Result<bool, DbError> {
        let inserted = self.conn.execute(
            "
            INSERT OR IGNORE INTO completion_logs (id, user_id, timestamp, type, data, is_undone)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                log.id,
                log.user_id,
                log.timestamp,
                log.kind.log_type(),
                log.payload.to_string(),
                log.is_undone,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Every completion fact: stored completion logs, then the `Complete`
    /// events that actually completed their attempt.
    pub fn completion_facts(&self) -> Result<Vec<CompletionFact>, DbError> {
        let mut facts = Vec::new();

        let mut stmt = self.conn.prepare(
            "
            SELECT id, user_id, timestamp, type, data, is_undone
            FROM completion_logs
            ORDER BY timestamp ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;
        for row in rows {
            let (id, user_id, timestamp, log_type, data, is_undone) = row?;
            let Some(kind) = SessionKind::from_log_type(&log_type) else {
                tracing::debug!(log_id = %id, %log_type, "ignoring non-completion log");
                continue;
            };
            // Unparseable payloads are left for session building to reject.
            let payload = serde_json::from_str(&data).unwrap_or(Value::Null);
            facts.push(CompletionFact {
                id,
                user_id,
                timestamp,
                kind,
                payload,
                is_undone,
            });
        }

        // Complete events that lost to a stop or cancel never finished any work.
        let mut stmt = self.conn.prepare(
            "
            SELECT e.id, e.attempt_id, e.data, e.occurred_at, e.created_at, e.source, a.user_id
            FROM events e
            JOIN attempts a ON a.id = e.attempt_id
            WHERE e.type = 'COMPLETE'
              AND a.status = 'COMPLETED'
              AND a.completed_at = e.occurred_at
            ORDER BY e.occurred_at ASC, e.id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((EventRow::from_row(row)?, row.get::<_, String>(6)?))
        })?;
        for row in rows {
            let (event_row, user_id) = row?;
            let event = event_row.into_event()?;
            facts.extend(CompletionFact::from_event(&event, &user_id));
        }

        Ok(facts)
    }

    /// Creates the session of every completion fact that does not have one.
    ///
    /// Runs in one transaction, so an interrupted run leaves nothing behind
    /// and a rerun creates nothing new.
    pub fn backfill_sessions(&mut self, days: &DayBoundary) -> Result<BackfillReport, DbError> {
        let facts = self.completion_facts()?;
        let ids: Vec<String> = facts.iter().map(|fact| session_id_for(&fact.id)).collect();
        let existing = existing_session_ids(&self.conn, &ids)?;

        let mut report = BackfillReport::default();
        let mut pending = Vec::new();
        for (fact, id) in facts.iter().zip(&ids) {
            if existing.contains(id) {
                report.already += 1;
                continue;
            }
            match build_session_from_completion_fact(fact, days) {
                Some(session) => pending.push(session),
                None => {
                    tracing::warn!(fact_id = %fact.id, "skipping malformed completion fact");
                    report.skipped += 1;
                }
            }
        }

        let tx = self.conn.transaction()?;
        for session in &pending {
            if insert_session(&tx, session)? {
                report.created += 1;
            } else {
                report.already += 1;
            }
        }
        tx.commit()?;

        tracing::info!(
            created = report.created,
            already = report.already,
            skipped = report.skipped,
            "backfilled sessions"
        );
        Ok(report)
    }

    /// Renames sessions stored under a bare fact id to the prefixed form.
    ///
    /// When the prefixed row already exists the legacy row is a duplicate of
    /// it and is removed instead.
    pub fn migrate_session_ids(&mut self) -> Result<MigrationReport, DbError> {
        let tx = self.conn.transaction()?;
        let legacy: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM sessions WHERE substr(id, 1, length(?1)) <> ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([SESSION_ID_PREFIX], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut report = MigrationReport::default();
        for id in &legacy {
            let canonical = session_id_for(id);
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?)",
                [&canonical],
                |row| row.get(0),
            )?;
            if taken {
                tx.execute("DELETE FROM sessions WHERE id = ?", [id])?;
                report.collapsed += 1;
            } else {
                tx.execute(
                    "UPDATE sessions SET id = ? WHERE id = ?",
                    params![canonical, id],
                )?;
                report.migrated += 1;
            }
        }
        tx.commit()?;

        tracing::info!(
            migrated = report.migrated,
            collapsed = report.collapsed,
            "migrated session ids"
        );
        Ok(report)
    }

    /// Stores a session as given. Returns `false` if the id was already stored.
    pub fn insert_session(&self, session: &Session) -> Result<bool, DbError> {
        insert_session(&self.conn, session)
    }

    /// Marks a session undone or restores it. Returns whether it exists.
    pub fn set_session_undone(&self, session_id: &str, undone: bool) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE sessions SET is_undone = ? WHERE id = ?",
            params![undone, session_id],
        )?;
        Ok(updated > 0)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, DbError> {
        self.conn
            .query_row(
                &format!("{SESSION_SELECT} WHERE id = ?"),
                [session_id],
                SessionRow::from_row,
            )
            .optional()?
            .map(SessionRow::into_session)
            .transpose()
    }

    /// Sessions counted towards `date`, in time order.
    pub fn sessions_on(&self, date: NaiveDate) -> Result<Vec<Session>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SESSION_SELECT} WHERE date = ? ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map([format_date(date)], SessionRow::from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_session()?);
        }
        Ok(sessions)
    }

    pub fn session_count(&self) -> Result<usize, DbError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

const SESSION_SELECT: &str = "
    SELECT id, user_id, timestamp, duration, paused_duration, points, date, type, title,
           subject, is_undone
    FROM sessions
";

/// Raw `sessions` row before parsing.
struct SessionRow {
    id: String,
    user_id: String,
    timestamp: String,
    duration: i64,
    paused_duration: i64,
    points: i64,
    date: String,
    kind: String,
    title: String,
    subject: Option<String>,
    is_undone: bool,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            timestamp: row.get(2)?,
            duration: row.get(3)?,
            paused_duration: row.get(4)?,
            points: row.get(5)?,
            date: row.get(6)?,
            kind: row.get(7)?,
            title: row.get(8)?,
            subject: row.get(9)?,
            is_undone: row.get(10)?,
        })
    }

    fn into_session(self) -> Result<Session, DbError> {
        let kind = self.kind.parse().map_err(|message| DbError::InvalidRow {
            record_id: self.id.clone(),
            message,
        })?;
        Ok(Session {
            timestamp: parse_timestamp(&self.timestamp, &self.id)?,
            date: parse_date(&self.date, &self.id)?,
            id: self.id,
            user_id: self.user_id,
            duration_secs: self.duration,
            paused_secs: self.paused_duration,
            points: self.points,
            kind,
            title: self.title,
            subject: self.subject,
            is_undone: self.is_undone,
        })
    }
}

fn insert_session(conn: &Connection, session: &Session) -> Result<bool, DbError> {
    let inserted = conn.execute(
        "
        INSERT OR IGNORE INTO sessions
            (id, user_id, timestamp, duration, paused_duration, points, date, type, title,
             subject, is_undone)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            session.id,
            session.user_id,
            format_timestamp(session.timestamp),
            session.duration_secs,
            session.paused_secs,
            session.points,
            format_date(session.date),
            session.kind.as_str(),
            session.title,
            session.subject,
            session.is_undone,
        ],
    )?;
    Ok(inserted > 0)
}

/// Returns which of `ids` already have a session row.
fn existing_session_ids(conn: &Connection, ids: &[String]) -> Result<HashSet<String>, DbError> {
    let mut existing = HashSet::new();
    for chunk in ids.chunks(BACKFILL_CHUNK_SIZE) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM sessions WHERE id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
        for row in rows {
            existing.insert(row?);
        }
    }
    Ok(existing)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::CompletionDetails;
    use crate::tests::at;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    pub(crate) fn log(id: &str, timestamp: &str, payload: Value) -> CompletionFact {
        CompletionFact {
            id: id.to_string(),
            user_id: "u1".to_string(),
            timestamp: timestamp.to_string(),
            kind: SessionKind::Task,
            payload,
            is_undone: false,
        }
    }

    fn legacy_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            user_id: "u1".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2025-09-01T06:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            duration_secs: 1200,
            paused_secs: 0,
            points: 20,
            date: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
            kind: SessionKind::Task,
            title: String::new(),
            subject: None,
            is_undone: false,
        }
    }

    #[test]
    fn backfill_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        assert!(
            db.record_completion_log(&log(
                "L1",
                "2025-09-01T06:00:00Z",
                json!({"duration": 1200, "pausedDuration": 0, "points": 20}),
            ))
            .unwrap()
        );
        db.record_completion_log(&log(
            "L2",
            "2025-09-01T10:00:00Z",
            json!({"duration": 600, "pausedDuration": 0, "points": 10}),
        ))
        .unwrap();

        let days = DayBoundary::default();
        let first = db.backfill_sessions(&days).unwrap();
        assert_eq!(
            first,
            BackfillReport {
                created: 2,
                already: 0,
                skipped: 0
            }
        );
        let second = db.backfill_sessions(&days).unwrap();
        assert_eq!(
            second,
            BackfillReport {
                created: 0,
                already: 2,
                skipped: 0
            }
        );
        assert_eq!(db.session_count().unwrap(), 2);

        let session = db.get_session("session-L1").unwrap().unwrap();
        assert_eq!(session.duration_secs, 1200);
        assert_eq!(session.date, NaiveDate::from_ymd_opt(2025, 9, 1).unwrap());
    }

    #[test]
    fn recording_the_same_log_twice_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        let entry = log("L1", "2025-09-01T06:00:00Z", json!({"duration": 60}));
        assert!(db.record_completion_log(&entry).unwrap());
        assert!(!db.record_completion_log(&entry).unwrap());
        assert_eq!(db.completion_facts().unwrap().len(), 1);
    }

    #[test]
    fn malformed_facts_are_skipped_every_run() {
        let mut db = Database::open_in_memory().unwrap();
        db.record_completion_log(&log(
            "bad",
            "2025-09-01T06:00:00Z",
            json!({"duration": "ten"}),
        ))
        .unwrap();
        db.record_completion_log(&log("good", "2025-09-01T06:00:00Z", json!({"duration": 60})))
            .unwrap();

        let days = DayBoundary::default();
        let report = db.backfill_sessions(&days).unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        let rerun = db.backfill_sessions(&days).unwrap();
        assert_eq!(rerun.created, 0);
        assert_eq!(rerun.skipped, 1);
        assert!(db.get_session("session-bad").unwrap().is_none());
    }

    #[test]
    fn corrupt_payload_json_counts_as_skipped() {
        let mut db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "
                INSERT INTO completion_logs (id, user_id, timestamp, type, data)
                VALUES ('x', 'u1', '2025-09-01T06:00:00Z', 'TIMER_SESSION_COMPLETE', 'not json')
                ",
                [],
            )
            .unwrap();
        let report = db.backfill_sessions(&DayBoundary::default()).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.created, 0);
    }

    #[test]
    fn migrate_then_backfill_yields_one_session() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_session(&legacy_session("L1")).unwrap();
        db.record_completion_log(&log(
            "L1",
            "2025-09-01T06:00:00Z",
            json!({"duration": 1200, "points": 20}),
        ))
        .unwrap();

        let migration = db.migrate_session_ids().unwrap();
        assert_eq!(
            migration,
            MigrationReport {
                migrated: 1,
                collapsed: 0
            }
        );
        let backfill = db.backfill_sessions(&DayBoundary::default()).unwrap();
        assert_eq!(backfill.created, 0);
        assert_eq!(backfill.already, 1);

        assert_eq!(db.session_count().unwrap(), 1);
        assert!(db.get_session("L1").unwrap().is_none());
        assert!(db.get_session("session-L1").unwrap().is_some());

        assert_eq!(db.migrate_session_ids().unwrap(), MigrationReport::default());
    }

    #[test]
    fn migration_collapses_legacy_duplicates() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_session(&legacy_session("L1")).unwrap();
        db.insert_session(&legacy_session("session-L1")).unwrap();

        let report = db.migrate_session_ids().unwrap();
        assert_eq!(
            report,
            MigrationReport {
                migrated: 0,
                collapsed: 1
            }
        );
        assert_eq!(db.session_count().unwrap(), 1);
    }

    #[test]
    fn completed_attempts_become_sessions() {
        let mut db = Database::open_in_memory().unwrap();
        let done = db.create_attempt_at("task-1", "u1", at(0)).unwrap();
        db.start_attempt_at(&done.id, at(1_000)).unwrap();
        db.complete_attempt_at(
            &done.id,
            CompletionDetails {
                points: 3,
                subject: Some("Math".into()),
                ..CompletionDetails::default()
            },
            at(61_000),
        )
        .unwrap();

        let abandoned = db.create_attempt_at("task-2", "u1", at(0)).unwrap();
        db.start_attempt_at(&abandoned.id, at(1_000)).unwrap();
        db.stop_attempt_at(&abandoned.id, None, at(2_000)).unwrap();

        let facts = db.completion_facts().unwrap();
        assert_eq!(facts.len(), 1);

        let report = db.backfill_sessions(&DayBoundary::utc_midnight()).unwrap();
        assert_eq!(report.created, 1);
        let complete_id = db.attempt_events(&done.id).unwrap().last().unwrap().id.clone();
        let session = db
            .get_session(&session_id_for(complete_id.as_str()))
            .unwrap()
            .unwrap();
        assert_eq!(session.duration_secs, 60);
        assert_eq!(session.points, 3);
        assert_eq!(session.subject.as_deref(), Some("Math"));
        assert_eq!(session.date, NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
    }

    #[test]
    fn undone_flag_round_trips() {
        let db = Database::open_in_memory().unwrap();
        db.insert_session(&legacy_session("session-L1")).unwrap();
        assert!(db.set_session_undone("session-L1", true).unwrap());
        assert!(db.get_session("session-L1").unwrap().unwrap().is_undone);
        assert!(!db.set_session_undone("missing", true).unwrap());
    }

    #[test]
    fn existence_check_spans_chunks() {
        let db = Database::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for n in 0..450 {
            let id = format!("session-{n}");
            if n % 3 == 0 {
                db.insert_session(&legacy_session(&id)).unwrap();
            }
            ids.push(id);
        }
        let existing = existing_session_ids(&db.conn, &ids).unwrap();
        assert_eq!(existing.len(), 150);
        assert!(existing.contains("session-447"));
    }
}
