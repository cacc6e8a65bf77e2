//! Cross-replica conflict resolution for attempts sharing an active key.
//!
//! Two replicas can each start an attempt for the same slot while offline.
//! When they meet, exactly one attempt must be demoted, and both replicas must
//! pick the same one without coordinating. The decision therefore depends only
//! on the two attempts' creation times (and ids, for exact ties), never on
//! which replica noticed the conflict.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::event::{Event, EventKind, EventSource};
use crate::types::{AttemptId, EventId};

/// Which replica an attempt was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contender {
    pub attempt_id: AttemptId,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Contender,
    pub loser: Contender,
}

/// Picks the surviving attempt: the older one wins.
///
/// Equal creation times fall back to the smaller attempt id.
pub fn resolve(local: &Contender, remote: &Contender) -> Resolution {
    let local_wins = (local.created_at, &local.attempt_id) <= (remote.created_at, &remote.attempt_id);
    let (winner, loser) = if local_wins {
        (local, remote)
    } else {
        (remote, local)
    };
    Resolution {
        winner: winner.clone(),
        loser: loser.clone(),
    }
}

/// Builds the synthetic event that demotes `resolution.loser`.
///
/// The id is derived from the loser's id, so every replica that resolves the
/// same conflict produces the same event and the store deduplicates it. It is
/// stamped one millisecond after the loser's creation, or at it when that
/// would overflow.
pub fn cancel_duplicate_event(resolution: &Resolution) -> Event {
    let loser = &resolution.loser;
    let stamp = loser
        .created_at
        .checked_add_signed(Duration::milliseconds(1))
        .unwrap_or(loser.created_at);
    Event {
        id: cancel_duplicate_event_id(&loser.attempt_id),
        attempt_id: loser.attempt_id.clone(),
        kind: EventKind::CancelDuplicate {
            winner_id: Some(resolution.winner.attempt_id.clone()),
        },
        occurred_at: stamp,
        created_at: stamp,
        source: EventSource::Sync,
    }
}

fn cancel_duplicate_event_id(loser: &AttemptId) -> EventId {
    let content = format!("cancel-duplicate|{loser}");
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, content.as_bytes()).to_string();
    // A v5 UUID is never empty.
    EventId::new(id).unwrap_or_else(|_| EventId::generate())
}
