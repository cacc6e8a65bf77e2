//! Core domain logic for the study tracker's activity log.
//!
//! This crate contains the fundamental types and pure logic for:
//! - Events: the append-only facts about an attempt
//! - Folding: deriving attempt state from its event stream
//! - Conflicts: picking which of two duplicate active attempts survives
//! - Sessions: mapping completion facts to reporting records
//! - Daily stats: summarizing a day's sessions
//! - Caching: a TTL cache for statistics reads

pub mod attempt;
pub mod cache;
pub mod conflict;
pub mod daily;
pub mod event;
pub mod event_type;
mod fold;
pub mod session;
mod types;

pub use attempt::{Attempt, AttemptStatus, active_key_for};
pub use cache::{Clock, SystemClock, TtlCache};
pub use conflict::{Contender, Origin, Resolution, cancel_duplicate_event, resolve};
pub use daily::{DailyStat, SubjectTotals, UNASSIGNED_SUBJECT, summarize_day};
pub use event::{Event, EventKind, EventSource};
pub use event_type::{EventType, UnknownEventType};
pub use fold::{AttemptState, check_transition, fold};
pub use session::{
    CompletionFact, DayBoundary, SESSION_ID_PREFIX, Session, SessionKind,
    build_session_from_completion_fact, session_id_for,
};
pub use types::{AttemptId, EventId, ValidationError};
