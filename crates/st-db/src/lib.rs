//! Storage layer for the study tracker activity log.
//!
//! Provides persistence for attempts, their events, completion logs, sessions
//! and daily statistics using `rusqlite`. [`Database`] is the single writer:
//! sync, backfill and aggregation all go through it rather than writing rows
//! themselves.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! This means a `Database` instance can be moved between threads but cannot be shared
//! across threads without external synchronization. Mutating operations take
//! `&mut self`, so two syncs can never interleave on one handle.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in ISO 8601 format with millisecond precision
//! (e.g., `2024-01-15T10:30:00.000Z`). This ensures:
//! - Lexicographic ordering matches chronological ordering
//! - Human-readable values in the database
//! - Timezone-aware (always UTC)
//!
//! Calendar dates (sessions, daily stats) are stored as `YYYY-MM-DD`.
//!
//! ## Event Payload Storage
//!
//! The `data` column stores the JSON-encoded [`EventKind`](st_core::EventKind),
//! tagged by `type`; the `type` column repeats the tag for indexing.
//! Events have no foreign key to `attempts`: a remote replica's events may
//! arrive before the event that creates the attempt.

mod attempts;
mod sessions;
mod stats;

use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use st_core::{AttemptId, Event, EventId, EventKind, ValidationError};

pub use attempts::{ApplyOutcome, CompletionDetails};
pub use sessions::{BackfillReport, MigrationReport};
pub use stats::{STATS_CACHE_PREFIX, StatsSelector};

/// Meta key holding the cursor returned by the last successful sync.
const LAST_SYNC_KEY: &str = "last_sync_timestamp";

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The underlying store failed or is unreachable.
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Input was rejected before any write.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// Another attempt already holds the active slot.
    #[error("an active attempt ({existing}) already exists for {active_key}")]
    Conflict {
        active_key: String,
        existing: String,
    },
    /// No attempt with this id exists locally.
    #[error("attempt {0} not found")]
    AttemptNotFound(String),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp for {record_id}: {timestamp}")]
    TimestampParse {
        record_id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// Failed to parse a stored date.
    #[error("invalid date for {record_id}: {date}")]
    InvalidDate { record_id: String, date: String },
    /// Failed to parse stored event payload JSON or one of its columns.
    #[error("invalid event data for {event_id}: {message}")]
    InvalidEventData { event_id: String, message: String },
    /// A stored attempt, session or stat row has a column that does not parse.
    #[error("invalid stored row {record_id}: {message}")]
    InvalidRow { record_id: String, message: String },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            -- Attempts: projection of each attempt's event stream
            -- active_key: set while non-terminal, NULL afterwards
            CREATE TABLE IF NOT EXISTS attempts (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                active_key TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_active_key ON attempts(active_key);
            CREATE INDEX IF NOT EXISTS idx_attempts_status ON attempts(status);

            -- Events: append-only facts about attempts
            -- type: event type (e.g., 'START')
            -- data: JSON payload tagged by type
            -- acknowledged: 1 once a remote peer has seen the event
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                attempt_id TEXT NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                source TEXT NOT NULL,
                acknowledged INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_events_attempt ON events(attempt_id, occurred_at);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
            CREATE INDEX IF NOT EXISTS idx_events_acknowledged ON events(acknowledged);

            -- Completion logs: legacy and manual completion facts
            CREATE TABLE IF NOT EXISTS completion_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                is_undone INTEGER NOT NULL DEFAULT 0
            );

            -- Sessions: one immutable reporting row per completion fact
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                duration INTEGER NOT NULL,
                paused_duration INTEGER NOT NULL DEFAULT 0,
                points INTEGER NOT NULL DEFAULT 0,
                date TEXT NOT NULL,
                type TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                subject TEXT,
                is_undone INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_date ON sessions(date);

            -- Daily stats: recomputed wholesale per date
            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                total_seconds INTEGER NOT NULL,
                paused_seconds INTEGER NOT NULL,
                points INTEGER NOT NULL,
                sessions_count INTEGER NOT NULL,
                focus_score REAL NOT NULL,
                subjects TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Lists local events no remote peer has acknowledged yet.
    pub fn unsynced_events(&self) -> Result<Vec<Event>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, attempt_id, data, occurred_at, created_at, source
            FROM events
            WHERE acknowledged = 0
            ORDER BY created_at ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([], EventRow::from_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    }

    /// Number of events waiting to be sent.
    pub fn unsynced_count(&self) -> Result<usize, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE acknowledged = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Marks `sent` as acknowledged and stores the new sync cursor.
    ///
    /// Both happen in one transaction so a crash never advances the cursor
    /// without acknowledging, or the reverse.
    pub fn record_sync(
        &mut self,
        sent: &[EventId],
        cursor: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE events SET acknowledged = 1 WHERE id = ?")?;
            for id in sent {
                stmt.execute([id.as_str()])?;
            }
        }
        tx.execute(
            "
            INSERT INTO meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![LAST_SYNC_KEY, format_timestamp(cursor)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Cursor returned by the last successful sync, if any.
    pub fn last_sync_timestamp(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?",
                [LAST_SYNC_KEY],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|value| parse_timestamp(&value, LAST_SYNC_KEY))
            .transpose()
    }
}

/// Raw `events` row before payload parsing.
#[derive(Debug)]
struct EventRow {
    id: String,
    attempt_id: String,
    data: String,
    occurred_at: String,
    created_at: String,
    source: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            attempt_id: row.get(1)?,
            data: row.get(2)?,
            occurred_at: row.get(3)?,
            created_at: row.get(4)?,
            source: row.get(5)?,
        })
    }

    fn into_event(self) -> Result<Event, DbError> {
        let invalid = |message: String| DbError::InvalidEventData {
            event_id: self.id.clone(),
            message,
        };
        let kind: EventKind =
            serde_json::from_str(&self.data).map_err(|err| invalid(err.to_string()))?;
        let source = self.source.parse().map_err(invalid)?;
        let attempt_id =
            AttemptId::new(self.attempt_id.as_str()).map_err(|err| invalid(err.to_string()))?;
        let occurred_at = parse_timestamp(&self.occurred_at, &self.id)?;
        let created_at = parse_timestamp(&self.created_at, &self.id)?;
        let id = EventId::new(self.id.as_str()).map_err(|err| invalid(err.to_string()))?;
        Ok(Event {
            id,
            attempt_id,
            kind,
            occurred_at,
            created_at,
            source,
        })
    }
}

fn parse_timestamp(timestamp: &str, record_id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            record_id: record_id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn parse_optional_timestamp(
    timestamp: Option<String>,
    record_id: &str,
) -> Result<Option<DateTime<Utc>>, DbError> {
    timestamp
        .map(|timestamp| parse_timestamp(&timestamp, record_id))
        .transpose()
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_date(date: &str, record_id: &str) -> Result<NaiveDate, DbError> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| DbError::InvalidDate {
        record_id: record_id.to_string(),
        date: date.to_string(),
    })
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    pub(crate) fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn open_on_disk_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("st.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        assert_eq!(db.unsynced_count().unwrap(), 0);
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().expect("open in-memory db");

        assert_eq!(
            table_columns(&db.conn, "attempts"),
            vec![
                "id",
                "entity_id",
                "user_id",
                "active_key",
                "status",
                "created_at",
                "started_at",
                "completed_at",
                "updated_at",
            ]
        );
        assert_eq!(
            table_columns(&db.conn, "events"),
            vec![
                "id",
                "attempt_id",
                "type",
                "data",
                "occurred_at",
                "created_at",
                "source",
                "acknowledged",
            ]
        );
        assert_eq!(
            table_columns(&db.conn, "daily_stats"),
            vec![
                "date",
                "total_seconds",
                "paused_seconds",
                "points",
                "sessions_count",
                "focus_score",
                "subjects",
                "updated_at",
            ]
        );

        let event_indexes = index_names(&db.conn, "events");
        let expected: HashSet<String> = [
            "idx_events_attempt",
            "idx_events_type",
            "idx_events_acknowledged",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert!(expected.is_subset(&event_indexes));
        assert!(index_names(&db.conn, "sessions").contains("idx_sessions_date"));
        assert!(index_names(&db.conn, "attempts").contains("idx_attempts_active_key"));
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .expect("prepare index_list");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query index_list");
        rows.map(|row| row.expect("index_list row")).collect()
    }

    #[test]
    fn record_sync_acknowledges_and_stores_cursor() {
        let mut db = Database::open_in_memory().unwrap();
        let attempt = db.create_attempt_at("task-1", "u1", at(1_000)).unwrap();
        db.start_attempt_at(&attempt.id, at(2_000)).unwrap();

        let unsynced = db.unsynced_events().unwrap();
        assert_eq!(unsynced.len(), 2);
        assert_eq!(db.last_sync_timestamp().unwrap(), None);

        let sent: Vec<EventId> = unsynced.iter().map(|e| e.id.clone()).collect();
        db.record_sync(&sent, at(5_000)).unwrap();

        assert!(db.unsynced_events().unwrap().is_empty());
        assert_eq!(db.last_sync_timestamp().unwrap(), Some(at(5_000)));

        db.record_sync(&[], at(6_000)).unwrap();
        assert_eq!(db.last_sync_timestamp().unwrap(), Some(at(6_000)));
    }

    #[test]
    fn corrupt_payload_surfaces_as_invalid_event_data() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "
                INSERT INTO events (id, attempt_id, type, data, occurred_at, created_at, source)
                VALUES ('bad', 'a1', 'START', '{\"type\":\"START\"}', '2025-01-01T00:00:00.000Z',
                        '2025-01-01T00:00:00.000Z', 'local')
                ",
                [],
            )
            .unwrap();
        let err = db.unsynced_events().unwrap_err();
        assert!(matches!(err, DbError::InvalidEventData { ref event_id, .. } if event_id == "bad"));
    }
}
