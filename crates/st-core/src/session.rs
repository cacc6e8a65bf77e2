//! Session records derived from completion facts.
//!
//! A completion fact is anything that says "a unit of work finished": a
//! legacy completion log row, or a `Complete` event in the attempt log. Each
//! fact maps to exactly one [`Session`] whose id is a pure function of the
//! fact id, which is what makes backfill safe to rerun.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::event::{Event, EventKind};
use crate::types::ValidationError;

/// Prefix that turns a completion fact id into its session id.
pub const SESSION_ID_PREFIX: &str = "session-";

/// Returns the canonical session id for a completion fact.
#[must_use]
pub fn session_id_for(fact_id: &str) -> String {
    format!("{SESSION_ID_PREFIX}{fact_id}")
}

/// What kind of entity the work was done on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Task,
    Routine,
}

impl SessionKind {
    /// Returns the string representation for SQL storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Routine => "routine",
        }
    }

    /// The completion log type that records this kind of session.
    #[must_use]
    pub const fn log_type(&self) -> &'static str {
        match self {
            Self::Task => "TIMER_SESSION_COMPLETE",
            Self::Routine => "ROUTINE_SESSION_COMPLETE",
        }
    }

    /// Maps a completion log type back to a kind. Other log types are not
    /// completion facts.
    #[must_use]
    pub fn from_log_type(log_type: &str) -> Option<Self> {
        match log_type {
            "TIMER_SESSION_COMPLETE" => Some(Self::Task),
            "ROUTINE_SESSION_COMPLETE" => Some(Self::Routine),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "routine" => Ok(Self::Routine),
            _ => Err(format!("invalid session kind: {s}")),
        }
    }
}

/// A historical record that a unit of work was completed.
///
/// The payload is loosely typed because legacy rows predate the typed event
/// log; [`build_session_from_completion_fact`] decides what is usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionFact {
    pub id: String,
    pub user_id: String,
    /// RFC 3339 timestamp, stored as written.
    pub timestamp: String,
    pub kind: SessionKind,
    pub payload: Value,
    #[serde(default)]
    pub is_undone: bool,
}

impl CompletionFact {
    /// Converts a `Complete` event into a completion fact keyed by the event id.
    ///
    /// Returns `None` for every other event type.
    pub fn from_event(event: &Event, user_id: &str) -> Option<Self> {
        let EventKind::Complete {
            duration_secs,
            paused_secs,
            points,
            entity_kind,
            title,
            subject,
        } = &event.kind
        else {
            return None;
        };
        Some(Self {
            id: event.id.to_string(),
            user_id: user_id.to_string(),
            timestamp: event
                .occurred_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: *entity_kind,
            payload: json!({
                "duration": duration_secs,
                "pausedDuration": paused_secs,
                "points": points,
                "title": title,
                "subject": subject,
            }),
            is_undone: false,
        })
    }
}

/// An immutable reporting record of completed work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: i64,
    pub paused_secs: i64,
    pub points: i64,
    /// Study day the session counts towards.
    pub date: NaiveDate,
    pub kind: SessionKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub is_undone: bool,
}

/// Where one study day ends and the next begins.
///
/// Late-night work counts towards the previous day until `rollover_hour`
/// (local to `offset`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBoundary {
    offset: FixedOffset,
    rollover_hour: u32,
}

impl Default for DayBoundary {
    fn default() -> Self {
        Self {
            offset: Utc.fix(),
            rollover_hour: 4,
        }
    }
}

impl DayBoundary {
    /// Creates a boundary at `rollover_hour` in a fixed UTC offset.
    pub fn new(rollover_hour: u32, utc_offset_minutes: i32) -> Result<Self, ValidationError> {
        if rollover_hour > 23 {
            return Err(ValidationError::OutOfRange {
                field: "day rollover hour",
                value: i64::from(rollover_hour),
            });
        }
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or(
            ValidationError::OutOfRange {
                field: "UTC offset minutes",
                value: i64::from(utc_offset_minutes),
            },
        )?;
        Ok(Self {
            offset,
            rollover_hour,
        })
    }

    /// Midnight-based boundary in UTC.
    #[must_use]
    pub fn utc_midnight() -> Self {
        Self {
            offset: Utc.fix(),
            rollover_hour: 0,
        }
    }

    /// The study day `timestamp` belongs to.
    #[must_use]
    pub fn study_date(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        let local = timestamp.with_timezone(&self.offset);
        (local - Duration::hours(i64::from(self.rollover_hour))).date_naive()
    }
}

/// Maps a completion fact to its session record.
///
/// Returns `None` when the fact cannot be trusted: unparseable timestamp, a
/// payload that is not an object, or a duration, paused duration or points
/// value that is non-numeric or negative.
pub fn build_session_from_completion_fact(
    fact: &CompletionFact,
    days: &DayBoundary,
) -> Option<Session> {
    if fact.id.trim().is_empty() {
        return None;
    }
    let timestamp = DateTime::parse_from_rfc3339(&fact.timestamp)
        .ok()?
        .with_timezone(&Utc);

    let payload = &fact.payload;
    if !payload.is_object() {
        return None;
    }
    let paused_secs = number(payload, "pausedDuration")?.unwrap_or(0);
    let duration_secs = match number(payload, "duration")? {
        Some(duration) => duration,
        None => number(payload, "productiveDuration")?.unwrap_or(0) + paused_secs,
    };
    let points = number(payload, "points")?.unwrap_or(0);
    if duration_secs < 0 || paused_secs < 0 || points < 0 {
        return None;
    }

    let title = payload
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let subject = payload
        .get("subject")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|subject| !subject.is_empty())
        .map(str::to_string);

    Some(Session {
        id: session_id_for(&fact.id),
        user_id: fact.user_id.clone(),
        timestamp,
        duration_secs,
        paused_secs,
        points,
        date: days.study_date(timestamp),
        kind: fact.kind,
        title,
        subject,
        is_undone: fact.is_undone,
    })
}

/// Reads a numeric payload field.
///
/// `Some(None)` means absent or null; outer `None` means present but not a
/// finite number. Numeric strings are accepted since older clients wrote them.
#[expect(
    clippy::cast_possible_truncation,
    reason = "durations and points are far below i64 range"
)]
fn number(payload: &Value, key: &str) -> Option<Option<i64>> {
    let value = match payload.get(key) {
        None | Some(Value::Null) => return Some(None),
        Some(Value::Number(n)) => n.as_f64()?,
        Some(Value::String(s)) => s.trim().parse::<f64>().ok()?,
        Some(_) => return None,
    };
    value.is_finite().then(|| Some(value.round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;
    use crate::types::{AttemptId, EventId};

    fn fact(id: &str, timestamp: &str, payload: Value) -> CompletionFact {
        CompletionFact {
            id: id.to_string(),
            user_id: "u1".to_string(),
            timestamp: timestamp.to_string(),
            kind: SessionKind::Task,
            payload,
            is_undone: false,
        }
    }

    #[test]
    fn builds_session_with_prefixed_id() {
        let fact = fact(
            "L1",
            "2025-09-01T06:00:00Z",
            json!({"duration": 1200, "pausedDuration": 0, "points": 20, "title": "Algebra", "subject": "Math"}),
        );
        let session = build_session_from_completion_fact(&fact, &DayBoundary::default()).unwrap();
        assert_eq!(session.id, "session-L1");
        assert_eq!(session.duration_secs, 1200);
        assert_eq!(session.points, 20);
        assert_eq!(session.date, NaiveDate::from_ymd_opt(2025, 9, 1).unwrap());
        assert_eq!(session.title, "Algebra");
        assert_eq!(session.subject.as_deref(), Some("Math"));
    }

    #[test]
    fn duration_falls_back_to_productive_plus_paused() {
        let fact = fact(
            "L2",
            "2025-09-01T06:00:00Z",
            json!({"productiveDuration": "500", "pausedDuration": 100}),
        );
        let session = build_session_from_completion_fact(&fact, &DayBoundary::default()).unwrap();
        assert_eq!(session.duration_secs, 600);
        assert_eq!(session.paused_secs, 100);
        assert_eq!(session.points, 0);
        assert_eq!(session.title, "");
    }

    #[test]
    fn malformed_facts_yield_none() {
        let days = DayBoundary::default();
        let bad_time = fact("x", "yesterday", json!({"duration": 10}));
        assert!(build_session_from_completion_fact(&bad_time, &days).is_none());

        let bad_number = fact("x", "2025-09-01T06:00:00Z", json!({"duration": "ten"}));
        assert!(build_session_from_completion_fact(&bad_number, &days).is_none());

        let negative = fact("x", "2025-09-01T06:00:00Z", json!({"points": -5}));
        assert!(build_session_from_completion_fact(&negative, &days).is_none());

        let wrong_shape = fact("x", "2025-09-01T06:00:00Z", json!({"duration": [1]}));
        assert!(build_session_from_completion_fact(&wrong_shape, &days).is_none());

        let not_an_object = fact("x", "2025-09-01T06:00:00Z", Value::Null);
        assert!(build_session_from_completion_fact(&not_an_object, &days).is_none());
    }

    #[test]
    fn early_morning_counts_towards_previous_day() {
        let days = DayBoundary::default();
        let ts = DateTime::parse_from_rfc3339("2025-09-02T03:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            days.study_date(ts),
            NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()
        );
        assert_eq!(
            DayBoundary::utc_midnight().study_date(ts),
            NaiveDate::from_ymd_opt(2025, 9, 2).unwrap()
        );
    }

    #[test]
    fn offset_shifts_study_day() {
        // 23:30Z is 08:30 the next day at UTC+9.
        let days = DayBoundary::new(4, 9 * 60).unwrap();
        let ts = DateTime::parse_from_rfc3339("2025-09-01T23:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            days.study_date(ts),
            NaiveDate::from_ymd_opt(2025, 9, 2).unwrap()
        );
        assert!(DayBoundary::new(24, 0).is_err());
        assert!(DayBoundary::new(4, 24 * 60).is_err());
    }

    #[test]
    fn complete_event_becomes_fact() {
        let event = Event {
            id: EventId::new("evt-9").unwrap(),
            attempt_id: AttemptId::new("a1").unwrap(),
            kind: EventKind::Complete {
                duration_secs: 900,
                paused_secs: 60,
                points: 15,
                entity_kind: SessionKind::Routine,
                title: Some("Morning review".into()),
                subject: None,
            },
            occurred_at: DateTime::from_timestamp(1_756_706_400, 0).unwrap(),
            created_at: DateTime::from_timestamp(1_756_706_400, 0).unwrap(),
            source: EventSource::Local,
        };
        let fact = CompletionFact::from_event(&event, "u1").unwrap();
        let session =
            build_session_from_completion_fact(&fact, &DayBoundary::utc_midnight()).unwrap();
        assert_eq!(session.id, "session-evt-9");
        assert_eq!(session.kind, SessionKind::Routine);
        assert_eq!(session.duration_secs, 900);
        assert_eq!(session.paused_secs, 60);
        assert_eq!(session.title, "Morning review");
        assert!(session.subject.is_none());
    }

    #[test]
    fn log_types_map_to_kinds() {
        assert_eq!(
            SessionKind::from_log_type("ROUTINE_SESSION_COMPLETE"),
            Some(SessionKind::Routine)
        );
        assert_eq!(SessionKind::from_log_type("BADGE_EARNED"), None);
        assert_eq!(
            SessionKind::from_log_type(SessionKind::Task.log_type()),
            Some(SessionKind::Task)
        );
    }
}
