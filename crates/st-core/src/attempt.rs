//! Attempts - timed work sessions on a task or routine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AttemptId;

/// Lifecycle status of an attempt.
///
/// `Created`, `Started` and `Paused` are active; the rest are terminal and
/// never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Created,
    Started,
    Paused,
    Completed,
    Stopped,
    Cancelled,
}

impl AttemptStatus {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Stopped => "STOPPED",
            Self::Cancelled => "CANCELLED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Cancelled)
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "STARTED" => Ok(Self::Started),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "STOPPED" => Ok(Self::Stopped),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("invalid attempt status: {s}")),
        }
    }
}

/// Projection of an attempt's event stream.
///
/// Never edited directly: the store rewrites it from [`crate::fold`] after every
/// append, so it is always recomputable from events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    /// The task or routine being worked on.
    pub entity_id: String,
    pub user_id: String,
    /// Uniqueness slot while active; cleared once the attempt is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_key: Option<String>,
    pub status: AttemptStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Derives the slot that may hold at most one active attempt.
#[must_use]
pub fn active_key_for(user_id: &str, entity_id: &str) -> String {
    format!("{user_id}|{entity_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!AttemptStatus::Created.is_terminal());
        assert!(!AttemptStatus::Started.is_terminal());
        assert!(!AttemptStatus::Paused.is_terminal());
        assert!(AttemptStatus::Completed.is_terminal());
        assert!(AttemptStatus::Stopped.is_terminal());
        assert!(AttemptStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_parses_its_own_output() {
        for status in [
            AttemptStatus::Created,
            AttemptStatus::Started,
            AttemptStatus::Paused,
            AttemptStatus::Completed,
            AttemptStatus::Stopped,
            AttemptStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<AttemptStatus>(), Ok(status));
        }
        assert!("NOT_STARTED".parse::<AttemptStatus>().is_err());
    }

    #[test]
    fn active_key_joins_user_and_entity() {
        assert_eq!(active_key_for("u1", "task-9"), "u1|task-9");
    }
}
