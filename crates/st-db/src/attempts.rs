//! Event store operations: appending attempt events and maintaining the
//! attempt projection.
//!
//! Every write follows the same shape inside one transaction: load the
//! attempt's stream, insert the new events, fold the full stream and rewrite
//! the `attempts` row from the folded state.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use st_core::{
    Attempt, AttemptId, AttemptState, AttemptStatus, Event, EventKind, EventSource, SessionKind,
    ValidationError, active_key_for, check_transition, fold,
};

use crate::{
    Database, DbError, EventRow, format_timestamp, parse_optional_timestamp, parse_timestamp,
};

/// Result of [`Database::apply_events`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Events that were new to the store.
    pub inserted: usize,
    /// Events whose id was already stored.
    pub skipped: usize,
}

/// Figures recorded when an attempt completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionDetails {
    /// Total seconds. Measured from the event stream when `None`.
    pub duration_secs: Option<i64>,
    /// Paused seconds. Measured from the event stream when `None`.
    pub paused_secs: Option<i64>,
    pub points: i64,
    pub entity_kind: SessionKind,
    pub title: Option<String>,
    pub subject: Option<String>,
}

/// What a pending append sees of the attempt it extends.
struct AppendContext<'a> {
    attempt: &'a Attempt,
    state: &'a AttemptState,
    /// `occurred_at` of the latest stored event.
    tail: Option<DateTime<Utc>>,
    /// Timestamp the new event will carry.
    stamp: DateTime<Utc>,
}

impl AppendContext<'_> {
    /// Running and paused milliseconds up to `stamp`, including the segment
    /// still open since the last event.
    fn measured_ms(&self) -> (i64, i64) {
        let open = self
            .tail
            .map(|tail| (self.stamp - tail).num_milliseconds().max(0))
            .unwrap_or_default();
        match self.state.status {
            AttemptStatus::Started => (self.state.active_ms + open, self.state.paused_ms),
            AttemptStatus::Paused => (self.state.active_ms, self.state.paused_ms + open),
            _ => (self.state.active_ms, self.state.paused_ms),
        }
    }
}

impl Database {
    /// Opens a new attempt for `entity_id`.
    ///
    /// Fails with [`DbError::Conflict`] while another attempt for the same
    /// user and entity is still active.
    pub fn create_attempt(&mut self, entity_id: &str, user_id: &str) -> Result<Attempt, DbError> {
        self.create_attempt_at(entity_id, user_id, Utc::now())
    }

    /// Like [`create_attempt`](Self::create_attempt) with an explicit clock value.
    pub fn create_attempt_at(
        &mut self,
        entity_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Attempt, DbError> {
        let kind = EventKind::Create {
            entity_id: entity_id.trim().to_string(),
            user_id: user_id.trim().to_string(),
        };
        kind.validate()?;
        let active_key = active_key_for(user_id.trim(), entity_id.trim());

        let tx = self.conn.transaction()?;
        if let Some(existing) = load_active_by_key(&tx, &active_key)? {
            return Err(DbError::Conflict {
                active_key,
                existing: existing.id.to_string(),
            });
        }

        let attempt_id = AttemptId::generate();
        let event = Event::local(attempt_id.clone(), kind, now);
        insert_event(&tx, &event)?;
        project(&tx, &attempt_id, &fold(std::slice::from_ref(&event)), now)?;
        let attempt = load_attempt(&tx, &attempt_id)?
            .ok_or_else(|| DbError::AttemptNotFound(attempt_id.to_string()))?;
        tx.commit()?;

        tracing::debug!(attempt_id = %attempt.id, %active_key, "created attempt");
        Ok(attempt)
    }

    pub fn start_attempt(&mut self, attempt_id: &AttemptId) -> Result<Attempt, DbError> {
        self.start_attempt_at(attempt_id, Utc::now())
    }

    /// Starts work on a created attempt, claiming its active key.
    pub fn start_attempt_at(
        &mut self,
        attempt_id: &AttemptId,
        now: DateTime<Utc>,
    ) -> Result<Attempt, DbError> {
        self.append_at(attempt_id, now, |ctx| EventKind::Start {
            active_key: active_key_for(&ctx.attempt.user_id, &ctx.attempt.entity_id),
        })
    }

    pub fn pause_attempt(&mut self, attempt_id: &AttemptId) -> Result<Attempt, DbError> {
        self.pause_attempt_at(attempt_id, Utc::now())
    }

    pub fn pause_attempt_at(
        &mut self,
        attempt_id: &AttemptId,
        now: DateTime<Utc>,
    ) -> Result<Attempt, DbError> {
        self.append_at(attempt_id, now, |_| EventKind::Pause)
    }

    pub fn resume_attempt(&mut self, attempt_id: &AttemptId) -> Result<Attempt, DbError> {
        self.resume_attempt_at(attempt_id, Utc::now())
    }

    pub fn resume_attempt_at(
        &mut self,
        attempt_id: &AttemptId,
        now: DateTime<Utc>,
    ) -> Result<Attempt, DbError> {
        self.append_at(attempt_id, now, |_| EventKind::Resume)
    }

    /// Abandons an attempt, freeing its active key.
    pub fn stop_attempt(
        &mut self,
        attempt_id: &AttemptId,
        reason: Option<String>,
    ) -> Result<Attempt, DbError> {
        self.stop_attempt_at(attempt_id, reason, Utc::now())
    }

    pub fn stop_attempt_at(
        &mut self,
        attempt_id: &AttemptId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Attempt, DbError> {
        self.append_at(attempt_id, now, |_| EventKind::Stop { reason })
    }

    /// Finishes an attempt. Missing durations are measured from its events.
    pub fn complete_attempt(
        &mut self,
        attempt_id: &AttemptId,
        details: CompletionDetails,
    ) -> Result<Attempt, DbError> {
        self.complete_attempt_at(attempt_id, details, Utc::now())
    }

    pub fn complete_attempt_at(
        &mut self,
        attempt_id: &AttemptId,
        details: CompletionDetails,
        now: DateTime<Utc>,
    ) -> Result<Attempt, DbError> {
        self.append_at(attempt_id, now, |ctx| {
            let (active_ms, paused_ms) = ctx.measured_ms();
            EventKind::Complete {
                duration_secs: details
                    .duration_secs
                    .unwrap_or((active_ms + paused_ms) / 1000),
                paused_secs: details.paused_secs.unwrap_or(paused_ms / 1000),
                points: details.points,
                entity_kind: details.entity_kind,
                title: details.title,
                subject: details.subject,
            }
        })
    }

    /// Appends one local event after checking it against the folded state.
    fn append_at(
        &mut self,
        attempt_id: &AttemptId,
        now: DateTime<Utc>,
        build: impl FnOnce(&AppendContext<'_>) -> EventKind,
    ) -> Result<Attempt, DbError> {
        let tx = self.conn.transaction()?;
        let attempt = load_attempt(&tx, attempt_id)?
            .ok_or_else(|| DbError::AttemptNotFound(attempt_id.to_string()))?;
        let mut events = load_events(&tx, attempt_id)?;
        let state = fold(&events);

        // Keep appends after the stream's tail even if the clock went backwards.
        let tail = events.iter().map(|event| event.occurred_at).max();
        let stamp = match tail {
            Some(tail) if now <= tail => tail + Duration::milliseconds(1),
            _ => now,
        };

        let kind = build(&AppendContext {
            attempt: &attempt,
            state: &state,
            tail,
            stamp,
        });
        kind.validate()?;
        check_transition(state.status, &kind)?;

        let event = Event::local(attempt_id.clone(), kind, stamp);
        insert_event(&tx, &event)?;
        let event_type = event.event_type();
        events.push(event);
        project(&tx, attempt_id, &fold(&events), now)?;
        let attempt = load_attempt(&tx, attempt_id)?
            .ok_or_else(|| DbError::AttemptNotFound(attempt_id.to_string()))?;
        tx.commit()?;

        tracing::debug!(%attempt_id, %event_type, status = %attempt.status, "appended event");
        Ok(attempt)
    }

    /// Merges externally produced events into one attempt's stream.
    ///
    /// The whole batch is validated before anything is written. Known ids are
    /// skipped, so applying the same batch twice changes nothing.
    pub fn apply_events(
        &mut self,
        attempt_id: &AttemptId,
        events: &[Event],
    ) -> Result<ApplyOutcome, DbError> {
        for event in events {
            event.validate()?;
            if event.attempt_id != *attempt_id {
                return Err(ValidationError::AttemptMismatch {
                    event_id: event.id.to_string(),
                    expected: attempt_id.to_string(),
                    found: event.attempt_id.to_string(),
                }
                .into());
            }
        }

        let mut ordered: Vec<&Event> = events.iter().collect();
        ordered.sort_by(|a, b| a.stream_order(b));

        let tx = self.conn.transaction()?;
        let mut outcome = ApplyOutcome::default();
        for event in ordered {
            if insert_event(&tx, event)? {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        if outcome.inserted > 0 {
            let stream = load_events(&tx, attempt_id)?;
            project(&tx, attempt_id, &fold(&stream), Utc::now())?;
        }
        tx.commit()?;

        tracing::debug!(
            %attempt_id,
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            "applied events"
        );
        Ok(outcome)
    }

    pub fn get_attempt_by_id(&self, attempt_id: &AttemptId) -> Result<Option<Attempt>, DbError> {
        load_attempt(&self.conn, attempt_id)
    }

    /// All attempts, oldest first.
    pub fn list_attempts(&self) -> Result<Vec<Attempt>, DbError> {
        query_attempts(
            &self.conn,
            &format!("{ATTEMPT_SELECT} ORDER BY created_at ASC, id ASC"),
            [],
        )
    }

    /// The attempt's events in stream order.
    pub fn attempt_events(&self, attempt_id: &AttemptId) -> Result<Vec<Event>, DbError> {
        load_events(&self.conn, attempt_id)
    }

    /// Folded state of an attempt, including time totals the projection omits.
    pub fn attempt_state(&self, attempt_id: &AttemptId) -> Result<AttemptState, DbError> {
        Ok(fold(&load_events(&self.conn, attempt_id)?))
    }

    /// The non-terminal attempt holding `active_key`, if any.
    pub fn active_attempt_by_key(&self, active_key: &str) -> Result<Option<Attempt>, DbError> {
        load_active_by_key(&self.conn, active_key)
    }

    /// Every non-terminal attempt, oldest first.
    pub fn active_attempts(&self) -> Result<Vec<Attempt>, DbError> {
        query_attempts(
            &self.conn,
            &format!("{ATTEMPT_SELECT} WHERE active_key IS NOT NULL ORDER BY created_at ASC, id ASC"),
            [],
        )
    }
}

const ATTEMPT_SELECT: &str = "
    SELECT id, entity_id, user_id, active_key, status, created_at, started_at, completed_at
    FROM attempts
";

/// Raw `attempts` row before timestamp parsing.
struct AttemptRow {
    id: String,
    entity_id: String,
    user_id: String,
    active_key: Option<String>,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl AttemptRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            user_id: row.get(2)?,
            active_key: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_attempt(self) -> Result<Attempt, DbError> {
        let invalid = |message: String| DbError::InvalidRow {
            record_id: self.id.clone(),
            message,
        };
        let status = self.status.parse().map_err(invalid)?;
        let created_at = parse_timestamp(&self.created_at, &self.id)?;
        let started_at = parse_optional_timestamp(self.started_at, &self.id)?;
        let completed_at = parse_optional_timestamp(self.completed_at, &self.id)?;
        let id = AttemptId::new(self.id.as_str()).map_err(|err| invalid(err.to_string()))?;
        Ok(Attempt {
            id,
            entity_id: self.entity_id,
            user_id: self.user_id,
            active_key: self.active_key,
            status,
            created_at,
            started_at,
            completed_at,
        })
    }
}

fn query_attempts<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Attempt>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, AttemptRow::from_row)?;
    let mut attempts = Vec::new();
    for row in rows {
        attempts.push(row?.into_attempt()?);
    }
    Ok(attempts)
}

pub(crate) fn load_attempt(
    conn: &Connection,
    attempt_id: &AttemptId,
) -> Result<Option<Attempt>, DbError> {
    conn.query_row(
        &format!("{ATTEMPT_SELECT} WHERE id = ?"),
        [attempt_id.as_str()],
        AttemptRow::from_row,
    )
    .optional()?
    .map(AttemptRow::into_attempt)
    .transpose()
}

fn load_active_by_key(conn: &Connection, active_key: &str) -> Result<Option<Attempt>, DbError> {
    conn.query_row(
        &format!("{ATTEMPT_SELECT} WHERE active_key = ? ORDER BY created_at ASC, id ASC LIMIT 1"),
        [active_key],
        AttemptRow::from_row,
    )
    .optional()?
    .map(AttemptRow::into_attempt)
    .transpose()
}

pub(crate) fn load_events(conn: &Connection, attempt_id: &AttemptId) -> Result<Vec<Event>, DbError> {
    let mut stmt = conn.prepare(
        "
        SELECT id, attempt_id, data, occurred_at, created_at, source
        FROM events
        WHERE attempt_id = ?
        ORDER BY occurred_at ASC, created_at ASC, id ASC
        ",
    )?;
    let rows = stmt.query_map([attempt_id.as_str()], EventRow::from_row)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event()?);
    }
    Ok(events)
}

/// Inserts an event unless its id is already stored. Returns whether it was new.
///
/// Events received from a peer are stored as already acknowledged.
fn insert_event(conn: &Connection, event: &Event) -> Result<bool, DbError> {
    let data = serde_json::to_string(&event.kind).map_err(|err| DbError::InvalidEventData {
        event_id: event.id.to_string(),
        message: err.to_string(),
    })?;
    let inserted = conn.execute(
        "
        INSERT OR IGNORE INTO events
            (id, attempt_id, type, data, occurred_at, created_at, source, acknowledged)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            event.id.as_str(),
            event.attempt_id.as_str(),
            event.event_type().as_str(),
            data,
            format_timestamp(event.occurred_at),
            format_timestamp(event.created_at),
            event.source.as_str(),
            event.source == EventSource::Remote,
        ],
    )?;
    Ok(inserted > 0)
}

/// Rewrites the `attempts` row from folded state.
///
/// A stream without its `Create` event can only update an existing row; the
/// row is inserted once `Create` arrives.
fn project(
    conn: &Connection,
    attempt_id: &AttemptId,
    state: &AttemptState,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let active_key = if state.status.is_terminal() {
        None
    } else {
        state.active_key.clone().or_else(|| {
            state
                .user_id
                .as_deref()
                .zip(state.entity_id.as_deref())
                .map(|(user_id, entity_id)| active_key_for(user_id, entity_id))
        })
    };
    let started_at = state.started_at.map(format_timestamp);
    let completed_at = state.completed_at.map(format_timestamp);

    if let (Some(entity_id), Some(user_id), Some(created_at)) =
        (&state.entity_id, &state.user_id, state.created_at)
    {
        conn.execute(
            "
            INSERT INTO attempts
                (id, entity_id, user_id, active_key, status, created_at,
                 started_at, completed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                active_key = excluded.active_key,
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at
            ",
            params![
                attempt_id.as_str(),
                entity_id,
                user_id,
                active_key,
                state.status.as_str(),
                format_timestamp(created_at),
                started_at,
                completed_at,
                format_timestamp(now),
            ],
        )?;
    } else {
        conn.execute(
            "
            UPDATE attempts
            SET active_key = ?, status = ?, started_at = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            ",
            params![
                active_key,
                state.status.as_str(),
                started_at,
                completed_at,
                format_timestamp(now),
                attempt_id.as_str(),
            ],
        )?;
    }
    Ok(())
}
