//! Folding an attempt's event stream into its current state.
//!
//! The fold is the only place attempt status is decided. The store never
//! writes a status it did not get from here, which keeps replays and partial
//! merges safe: folding the same set of events always yields the same state.
//!
//! Key invariants:
//! - Events are ordered by `occurred_at`, then `created_at`, then id
//! - Duplicate event ids are applied once
//! - Terminal states never change; later events are ignored
//! - An event that is invalid for the current state is ignored, not an error

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attempt::AttemptStatus;
use crate::event::{Event, EventKind};
use crate::types::ValidationError;

/// State derived from an attempt's events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptState {
    pub status: AttemptStatus,
    /// Set by the `Create` event, if the stream has one.
    pub entity_id: Option<String>,
    pub user_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Slot announced by the first `Start`.
    pub active_key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the attempt reached any terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Milliseconds spent running between events.
    pub active_ms: i64,
    /// Milliseconds spent paused between events.
    pub paused_ms: i64,
    pub points: i64,
    /// Distinct events folded, including ignored ones.
    pub event_count: usize,
}

impl Default for AttemptState {
    fn default() -> Self {
        Self {
            status: AttemptStatus::Created,
            entity_id: None,
            user_id: None,
            created_at: None,
            active_key: None,
            started_at: None,
            completed_at: None,
            ended_at: None,
            active_ms: 0,
            paused_ms: 0,
            points: 0,
            event_count: 0,
        }
    }
}

impl AttemptState {
    /// Whether the stream contained the attempt's `Create` event.
    pub const fn is_known(&self) -> bool {
        self.entity_id.is_some()
    }
}

/// Returns the status `kind` moves an attempt to from `status`.
///
/// Used by the store to refuse an action before appending anything.
pub fn check_transition(
    status: AttemptStatus,
    kind: &EventKind,
) -> Result<AttemptStatus, ValidationError> {
    use AttemptStatus::{Cancelled, Completed, Created, Paused, Started, Stopped};

    let next = match (status, kind) {
        (Created, EventKind::Create { .. }) => Some(Created),
        (Created, EventKind::Start { .. }) | (Paused, EventKind::Resume) => Some(Started),
        (Started, EventKind::Pause) => Some(Paused),
        (Started | Paused, EventKind::Complete { .. }) => Some(Completed),
        (Created | Started | Paused, EventKind::Stop { .. }) => Some(Stopped),
        (Created | Started | Paused, EventKind::CancelDuplicate { .. }) => Some(Cancelled),
        _ => None,
    };
    next.ok_or(ValidationError::InvalidTransition {
        status,
        event: kind.event_type(),
    })
}

/// Folds events into attempt state.
///
/// Input order does not matter; events are sorted before they are applied.
pub fn fold(events: &[Event]) -> AttemptState {
    let mut ordered: Vec<&Event> = events.iter().collect();
    ordered.sort_by(|a, b| a.stream_order(b));

    let mut seen = HashSet::with_capacity(ordered.len());
    let mut state = AttemptState::default();
    let mut last_at: Option<DateTime<Utc>> = None;

    for event in ordered {
        if !seen.insert(event.id.as_str()) {
            continue;
        }
        state.event_count += 1;

        if let Some(last) = last_at {
            let delta = event
                .occurred_at
                .signed_duration_since(last)
                .num_milliseconds()
                .max(0);
            match state.status {
                AttemptStatus::Started => state.active_ms += delta,
                AttemptStatus::Paused => state.paused_ms += delta,
                _ => {}
            }
        }
        last_at = Some(event.occurred_at);

        apply(&mut state, event);
    }

    state
}

fn apply(state: &mut AttemptState, event: &Event) {
    let Ok(next) = check_transition(state.status, &event.kind) else {
        tracing::trace!(
            event_id = %event.id,
            status = %state.status,
            event_type = %event.event_type(),
            "ignoring event invalid for current status"
        );
        return;
    };

    match &event.kind {
        EventKind::Create { entity_id, user_id } => {
            if state.entity_id.is_none() {
                state.entity_id = Some(entity_id.clone());
                state.user_id = Some(user_id.clone());
                state.created_at = Some(event.occurred_at);
            }
        }
        EventKind::Start { active_key } => {
            state.started_at = Some(event.occurred_at);
            state.active_key = Some(active_key.clone());
        }
        EventKind::Complete { points, .. } => {
            state.completed_at = Some(event.occurred_at);
            state.points += points;
        }
        EventKind::Pause
        | EventKind::Resume
        | EventKind::Stop { .. }
        | EventKind::CancelDuplicate { .. } => {}
    }

    if next.is_terminal() {
        state.ended_at = Some(event.occurred_at);
    }
    state.status = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;
    use crate::session::SessionKind;
    use crate::types::{AttemptId, EventId};

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn event(id: &str, kind: EventKind, ms: i64) -> Event {
        Event {
            id: EventId::new(id).unwrap(),
            attempt_id: AttemptId::new("attempt-1").unwrap(),
            kind,
            occurred_at: at(ms),
            created_at: at(ms),
            source: EventSource::Local,
        }
    }

    fn create() -> EventKind {
        EventKind::Create {
            entity_id: "task-1".into(),
            user_id: "u1".into(),
        }
    }

    fn start() -> EventKind {
        EventKind::Start {
            active_key: "u1|task-1".into(),
        }
    }

    fn complete(points: i64) -> EventKind {
        EventKind::Complete {
            duration_secs: 60,
            paused_secs: 10,
            points,
            entity_kind: SessionKind::Task,
            title: None,
            subject: None,
        }
    }

    #[test]
    fn empty_stream_is_created() {
        let state = fold(&[]);
        assert_eq!(state.status, AttemptStatus::Created);
        assert!(!state.is_known());
    }

    #[test]
    fn full_lifecycle_tracks_time() {
        let events = vec![
            event("e1", create(), 0),
            event("e2", start(), 1_000),
            event("e3", EventKind::Pause, 31_000),
            event("e4", EventKind::Resume, 41_000),
            event("e5", complete(5), 71_000),
        ];
        let state = fold(&events);
        assert_eq!(state.status, AttemptStatus::Completed);
        assert_eq!(state.active_ms, 60_000);
        assert_eq!(state.paused_ms, 10_000);
        assert_eq!(state.points, 5);
        assert_eq!(state.started_at, Some(at(1_000)));
        assert_eq!(state.completed_at, Some(at(71_000)));
        assert_eq!(state.ended_at, Some(at(71_000)));
        assert_eq!(state.active_key.as_deref(), Some("u1|task-1"));
    }

    #[test]
    fn input_order_does_not_matter() {
        let events = vec![
            event("e3", EventKind::Pause, 300),
            event("e1", create(), 100),
            event("e2", start(), 200),
        ];
        assert_eq!(fold(&events).status, AttemptStatus::Paused);
    }

    #[test]
    fn duplicate_ids_are_applied_once() {
        let events = vec![
            event("e1", create(), 0),
            event("e2", start(), 10),
            event("e3", complete(7), 20),
        ];
        let mut replayed = events.clone();
        replayed.push(events[2].clone());

        assert_eq!(fold(&events), fold(&replayed));
        assert_eq!(fold(&replayed).points, 7);
    }

    #[test]
    fn terminal_state_ignores_later_events() {
        let events = vec![
            event("e1", create(), 0),
            event("e2", start(), 10),
            event("e3", EventKind::Stop { reason: None }, 20),
            event("e4", EventKind::Resume, 30),
            event("e5", complete(3), 40),
        ];
        let state = fold(&events);
        assert_eq!(state.status, AttemptStatus::Stopped);
        assert_eq!(state.points, 0);
        assert_eq!(state.completed_at, None);
    }

    #[test]
    fn cancel_duplicate_sorts_before_late_start() {
        // Conflict resolution stamps the cancel one millisecond after creation.
        let events = vec![
            event("e1", create(), 100),
            event("cancel", EventKind::CancelDuplicate { winner_id: None }, 101),
            event("e2", start(), 5_000),
        ];
        let state = fold(&events);
        assert_eq!(state.status, AttemptStatus::Cancelled);
        assert_eq!(state.started_at, None);
    }

    #[test]
    fn pause_before_start_is_ignored() {
        let events = vec![event("e1", create(), 0), event("e2", EventKind::Pause, 10)];
        assert_eq!(fold(&events).status, AttemptStatus::Created);
    }

    #[test]
    fn check_transition_rejects_invalid_moves() {
        assert_eq!(
            check_transition(AttemptStatus::Created, &start()),
            Ok(AttemptStatus::Started)
        );
        assert_eq!(
            check_transition(AttemptStatus::Created, &complete(1)),
            Err(ValidationError::InvalidTransition {
                status: AttemptStatus::Created,
                event: crate::EventType::Complete,
            })
        );
        assert!(check_transition(AttemptStatus::Cancelled, &EventKind::Resume).is_err());
    }
}
