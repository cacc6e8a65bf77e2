//! Attempt events: the append-only facts an attempt's state is folded from.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_type::EventType;
use crate::session::SessionKind;
use crate::types::{AttemptId, EventId, ValidationError};

/// One immutable fact about an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub attempt_id: AttemptId,
    /// Type-specific payload, tagged by `type`.
    pub kind: EventKind,
    /// Logical time the fact happened.
    pub occurred_at: DateTime<Utc>,
    /// Time the fact was written; breaks ties between equal `occurred_at`.
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub source: EventSource,
}

/// Payload of an event, one variant per event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// The attempt was opened for an entity.
    Create { entity_id: String, user_id: String },
    /// Work began. Carries the slot so other replicas can detect duplicates.
    Start { active_key: String },
    Pause,
    Resume,
    /// The user abandoned the attempt.
    #[serde(alias = "CANCEL")]
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The attempt finished; the figures become a session record.
    Complete {
        duration_secs: i64,
        paused_secs: i64,
        points: i64,
        #[serde(default)]
        entity_kind: SessionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    /// Demotes the younger of two attempts competing for one slot.
    CancelDuplicate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        winner_id: Option<AttemptId>,
    },
}

impl EventKind {
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Create { .. } => EventType::Create,
            Self::Start { .. } => EventType::Start,
            Self::Pause => EventType::Pause,
            Self::Resume => EventType::Resume,
            Self::Stop { .. } => EventType::Stop,
            Self::Complete { .. } => EventType::Complete,
            Self::CancelDuplicate { .. } => EventType::CancelDuplicate,
        }
    }

    /// Checks payload constraints that the type system cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Create { entity_id, user_id } => {
                if entity_id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: "entity ID" });
                }
                if user_id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: "user ID" });
                }
                Ok(())
            }
            Self::Start { active_key } => {
                if active_key.trim().is_empty() {
                    return Err(ValidationError::Empty {
                        field: "active key",
                    });
                }
                Ok(())
            }
            Self::Complete {
                duration_secs,
                paused_secs,
                points,
                ..
            } => {
                for (field, value) in [
                    ("duration", *duration_secs),
                    ("paused duration", *paused_secs),
                    ("points", *points),
                ] {
                    if value < 0 {
                        return Err(ValidationError::NegativeValue { field, value });
                    }
                }
                if paused_secs > duration_secs {
                    return Err(ValidationError::PausedExceedsDuration {
                        duration_secs: *duration_secs,
                        paused_secs: *paused_secs,
                    });
                }
                Ok(())
            }
            Self::Pause | Self::Resume | Self::Stop { .. } | Self::CancelDuplicate { .. } => Ok(()),
        }
    }
}

/// Where an event was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Appended by a user action on this replica.
    #[default]
    Local,
    /// Received from another replica during sync.
    Remote,
    /// Synthesized by conflict resolution.
    Sync,
}

impl EventSource {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" | "timer" | "manual" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "sync" => Ok(Self::Sync),
            _ => Err(format!("invalid event source: {s}")),
        }
    }
}

impl Event {
    /// Creates a local event that happened at the moment it was written.
    pub fn local(attempt_id: AttemptId, kind: EventKind, now: DateTime<Utc>) -> Self {
        Self {
            id: EventId::generate(),
            attempt_id,
            kind,
            occurred_at: now,
            created_at: now,
            source: EventSource::Local,
        }
    }

    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.kind.validate()
    }

    /// Total order within one attempt's stream: `occurred_at`, then
    /// `created_at`, then id so equal timestamps still sort the same everywhere.
    pub fn stream_order(&self, other: &Self) -> Ordering {
        self.occurred_at
            .cmp(&other.occurred_at)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}
