//! Offline-first synchronization of attempt events.
//!
//! A sync round sends every local event no peer has acknowledged, receives
//! the events the peer has seen since the last cursor, settles duplicate
//! active attempts, then merges the received events one attempt at a time.
//!
//! The transport is behind [`RemoteExchange`]; [`HttpRemote`] is the shipped
//! implementation.

mod http;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use st_core::{
    AttemptId, Contender, Event, EventId, EventKind, EventSource, Origin, cancel_duplicate_event,
    fold, resolve,
};
use st_db::{Database, DbError};

pub use http::HttpRemote;

/// Errors talking to the remote peer.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The configured endpoint cannot be used.
    #[error("invalid endpoint: {reason}")]
    InvalidEndpoint { reason: &'static str },
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The peer answered with a non-success status.
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// Failed to parse response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors from a sync round.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] DbError),
}

/// What a replica sends: its unacknowledged events and its last cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub since: Option<DateTime<Utc>>,
    pub events: Vec<Event>,
}

/// What the peer answers: events new to this replica and the next cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub new_events: Vec<Event>,
    pub new_sync_timestamp: DateTime<Utc>,
}

/// Exchanges events with a remote peer.
pub trait RemoteExchange {
    fn exchange(
        &self,
        request: SyncRequest,
    ) -> impl Future<Output = Result<SyncResponse, RemoteError>> + Send;
}

/// Summary of one [`SyncEngine::sync_all`] round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Nothing was pending, so the remote was not contacted.
    pub skipped: bool,
    pub sent: usize,
    pub received: usize,
    /// Received events that were new to the store.
    pub inserted: usize,
    /// Duplicate active attempts demoted this round.
    pub conflicts: usize,
    /// Cursor stored at the end of the round.
    pub cursor: Option<DateTime<Utc>>,
}

/// Runs sync rounds against one remote.
///
/// Callers must not run two rounds on the same store at once; taking the
/// database by `&mut` enforces that within a process.
#[derive(Debug)]
pub struct SyncEngine<R> {
    remote: R,
}

impl<R: RemoteExchange> SyncEngine<R> {
    pub const fn new(remote: R) -> Self {
        Self { remote }
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    /// Runs one sync round.
    ///
    /// On any error the cursor is left where it was, so the next round resends
    /// and re-receives; every step is idempotent.
    pub async fn sync_all(&self, db: &mut Database) -> Result<SyncReport, SyncError> {
        let outgoing = db.unsynced_events()?;
        if outgoing.is_empty() {
            tracing::debug!("no unsynced events, skipping sync");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        let since = db.last_sync_timestamp()?;
        let sent: Vec<EventId> = outgoing.iter().map(|event| event.id.clone()).collect();
        tracing::debug!(sent = sent.len(), ?since, "exchanging events");
        let response = self
            .remote
            .exchange(SyncRequest {
                since,
                events: outgoing,
            })
            .await?;

        let mut incoming: Vec<Event> = response
            .new_events
            .into_iter()
            .map(|mut event| {
                event.source = EventSource::Remote;
                event
            })
            .collect();
        let received = incoming.len();

        let conflicts = resolve_conflicts(db, &mut incoming)?;

        let mut by_attempt: BTreeMap<AttemptId, Vec<Event>> = BTreeMap::new();
        for event in incoming {
            by_attempt
                .entry(event.attempt_id.clone())
                .or_default()
                .push(event);
        }
        let mut inserted = 0;
        for (attempt_id, events) in &by_attempt {
            inserted += db.apply_events(attempt_id, events)?.inserted;
        }

        db.record_sync(&sent, response.new_sync_timestamp)?;

        let report = SyncReport {
            skipped: false,
            sent: sent.len(),
            received,
            inserted,
            conflicts,
            cursor: Some(response.new_sync_timestamp),
        };
        tracing::info!(
            sent = report.sent,
            received = report.received,
            inserted = report.inserted,
            conflicts = report.conflicts,
            "sync complete"
        );
        Ok(report)
    }
}

/// Demotes one of each pair of active attempts that share an active key
/// across replicas.
///
/// A local loser is cancelled in the store right away; a remote loser's cancel
/// joins `incoming` so it is merged with the rest of that attempt's events.
fn resolve_conflicts(db: &mut Database, incoming: &mut Vec<Event>) -> Result<usize, DbError> {
    let started: BTreeSet<AttemptId> = incoming
        .iter()
        .filter(|event| matches!(event.kind, EventKind::Start { .. }))
        .map(|event| event.attempt_id.clone())
        .collect();

    let mut conflicts = 0;
    for remote_id in started {
        let batch: Vec<&Event> = incoming
            .iter()
            .filter(|event| event.attempt_id == remote_id)
            .collect();
        let mut stream = db.attempt_events(&remote_id)?;
        stream.extend(batch.iter().map(|event| (*event).clone()));
        let state = fold(&stream);
        if state.status.is_terminal() {
            continue;
        }
        let Some(active_key) = state.active_key.clone() else {
            continue;
        };

        let Some(local) = db
            .active_attempts()?
            .into_iter()
            .find(|attempt| attempt.active_key.as_deref() == Some(&active_key) && attempt.id != remote_id)
        else {
            continue;
        };

        let start_created_at = batch
            .iter()
            .find(|event| matches!(event.kind, EventKind::Start { .. }))
            .map(|event| event.created_at);
        let Some(remote_created_at) = db
            .get_attempt_by_id(&remote_id)?
            .map(|attempt| attempt.created_at)
            .or(state.created_at)
            .or(start_created_at)
        else {
            continue;
        };

        let resolution = resolve(
            &Contender {
                attempt_id: local.id.clone(),
                created_at: local.created_at,
                origin: Origin::Local,
            },
            &Contender {
                attempt_id: remote_id.clone(),
                created_at: remote_created_at,
                origin: Origin::Remote,
            },
        );
        tracing::warn!(
            %active_key,
            winner = %resolution.winner.attempt_id,
            loser = %resolution.loser.attempt_id,
            "resolved duplicate active attempt"
        );

        let cancel = cancel_duplicate_event(&resolution);
        match resolution.loser.origin {
            Origin::Local => {
                db.apply_events(&resolution.loser.attempt_id, &[cancel])?;
            }
            Origin::Remote => incoming.push(cancel),
        }
        conflicts += 1;
    }
    Ok(conflicts)
}
