//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attempt::AttemptStatus;
use crate::event_type::EventType;

/// Validation errors for core types and event payloads.
///
/// Anything that fails validation is rejected before it reaches storage, so a
/// stored event stream is always well-formed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// A numeric payload field was negative.
    #[error("{field} cannot be negative, got {value}")]
    NegativeValue { field: &'static str, value: i64 },

    /// A setting was outside its allowed range.
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    /// A completion reported more paused time than total time.
    #[error("paused time {paused_secs}s exceeds duration {duration_secs}s")]
    PausedExceedsDuration {
        duration_secs: i64,
        paused_secs: i64,
    },

    /// The event cannot be applied in the attempt's current status.
    #[error("cannot apply {event} to an attempt that is {status}")]
    InvalidTransition {
        status: AttemptStatus,
        event: EventType,
    },

    /// An event was submitted for a different attempt than the one being merged.
    #[error("event {event_id} belongs to attempt {found}, expected {expected}")]
    AttemptMismatch {
        event_id: String,
        expected: String,
        found: String,
    },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Generates a fresh random ID.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated attempt identifier.
    AttemptId, "attempt ID"
);

define_string_id!(
    /// A validated event identifier.
    ///
    /// Event IDs must be non-empty strings. Uniqueness is enforced by the store,
    /// which silently ignores a second insert of the same ID.
    EventId, "event ID"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_id_rejects_empty() {
        assert!(AttemptId::new("").is_err());
        assert!(AttemptId::new("   ").is_err());
        assert!(AttemptId::new("attempt-1").is_ok());
    }

    #[test]
    fn event_id_serde_rejects_empty() {
        let result: Result<EventId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
        let parsed: EventId = serde_json::from_str("\"evt-1\"").unwrap();
        assert_eq!(parsed.as_str(), "evt-1");
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(EventId::generate(), EventId::generate());
    }

    #[test]
    fn ids_order_lexicographically() {
        let a = AttemptId::new("a").unwrap();
        let b = AttemptId::new("b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn invalid_transition_message_names_both_sides() {
        let err = ValidationError::InvalidTransition {
            status: AttemptStatus::Completed,
            event: EventType::Pause,
        };
        assert_eq!(
            err.to_string(),
            "cannot apply PAUSE to an attempt that is COMPLETED"
        );
    }
}
