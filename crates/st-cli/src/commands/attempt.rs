//! Attempt commands: create, drive and inspect attempts.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Subcommand};
use serde_json::json;

use st_core::{Attempt, SessionKind};
use st_db::{CompletionDetails, Database};

use crate::Config;
use crate::commands::util::{format_duration, parse_attempt_id};

#[derive(Debug, Subcommand)]
pub enum AttemptAction {
    /// Open a new attempt for a task or routine.
    Create {
        /// The task or routine being worked on.
        entity_id: String,

        /// User to create the attempt for (defaults to the configured user).
        #[arg(long)]
        user: Option<String>,
    },

    /// Start working on a created attempt.
    Start { id: String },

    /// Pause a running attempt.
    Pause { id: String },

    /// Resume a paused attempt.
    Resume { id: String },

    /// Abandon an attempt.
    Stop {
        id: String,

        /// Why the attempt was abandoned.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Finish an attempt and record its figures.
    Complete(CompleteArgs),

    /// Show one attempt and its events.
    Show {
        id: String,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List attempts.
    List {
        /// Only attempts that are not finished.
        #[arg(long)]
        active: bool,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Args)]
pub struct CompleteArgs {
    pub id: String,

    /// Total seconds (measured from the attempt's events when omitted).
    #[arg(long)]
    pub duration: Option<i64>,

    /// Paused seconds (measured from the attempt's events when omitted).
    #[arg(long)]
    pub paused: Option<i64>,

    /// Points earned.
    #[arg(long, default_value_t = 0)]
    pub points: i64,

    /// The attempt was on a routine rather than a task.
    #[arg(long)]
    pub routine: bool,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub subject: Option<String>,
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    config: &Config,
    action: &AttemptAction,
    now: DateTime<Utc>,
) -> Result<()> {
    match action {
        AttemptAction::Create { entity_id, user } => {
            let user_id = user.as_deref().unwrap_or(&config.user_id);
            let attempt = db
                .create_attempt_at(entity_id, user_id, now)
                .with_context(|| format!("failed to create attempt for {entity_id}"))?;
            writeln!(writer, "Created {}", describe(&attempt))?;
        }
        AttemptAction::Start { id } => {
            let attempt = db.start_attempt_at(&parse_attempt_id(id)?, now)?;
            writeln!(writer, "Started {}", describe(&attempt))?;
        }
        AttemptAction::Pause { id } => {
            let attempt = db.pause_attempt_at(&parse_attempt_id(id)?, now)?;
            writeln!(writer, "Paused {}", describe(&attempt))?;
        }
        AttemptAction::Resume { id } => {
            let attempt = db.resume_attempt_at(&parse_attempt_id(id)?, now)?;
            writeln!(writer, "Resumed {}", describe(&attempt))?;
        }
        AttemptAction::Stop { id, reason } => {
            let attempt = db.stop_attempt_at(&parse_attempt_id(id)?, reason.clone(), now)?;
            writeln!(writer, "Stopped {}", describe(&attempt))?;
        }
        AttemptAction::Complete(args) => {
            let details = CompletionDetails {
                duration_secs: args.duration,
                paused_secs: args.paused,
                points: args.points,
                entity_kind: if args.routine {
                    SessionKind::Routine
                } else {
                    SessionKind::Task
                },
                title: args.title.clone(),
                subject: args.subject.clone(),
            };
            let attempt = db.complete_attempt_at(&parse_attempt_id(&args.id)?, details, now)?;
            writeln!(writer, "Completed {}", describe(&attempt))?;
        }
        AttemptAction::Show { id, json } => show(writer, db, id, *json)?,
        AttemptAction::List { active, json } => {
            let attempts = if *active {
                db.active_attempts()?
            } else {
                db.list_attempts()?
            };
            if *json {
                writeln!(writer, "{}", serde_json::to_string_pretty(&attempts)?)?;
            } else if attempts.is_empty() {
                writeln!(writer, "No attempts.")?;
            } else {
                for attempt in &attempts {
                    writeln!(
                        writer,
                        "{} {}",
                        describe(attempt),
                        format_timestamp(attempt.created_at)
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn show<W: Write>(writer: &mut W, db: &Database, id: &str, json: bool) -> Result<()> {
    let attempt_id = parse_attempt_id(id)?;
    let attempt = db
        .get_attempt_by_id(&attempt_id)?
        .with_context(|| format!("attempt {id} not found"))?;
    let events = db.attempt_events(&attempt_id)?;

    if json {
        let value = json!({ "attempt": attempt, "events": events });
        writeln!(writer, "{}", serde_json::to_string_pretty(&value)?)?;
        return Ok(());
    }

    let state = db.attempt_state(&attempt_id)?;
    let optional = |ts: Option<DateTime<Utc>>| ts.map_or_else(|| "-".to_string(), format_timestamp);

    writeln!(writer, "Attempt {}", attempt.id)?;
    writeln!(writer, "Entity: {}", attempt.entity_id)?;
    writeln!(writer, "User: {}", attempt.user_id)?;
    writeln!(writer, "Status: {}", attempt.status)?;
    writeln!(writer, "Created: {}", format_timestamp(attempt.created_at))?;
    writeln!(writer, "Started: {}", optional(attempt.started_at))?;
    writeln!(writer, "Completed: {}", optional(attempt.completed_at))?;
    writeln!(writer, "Active: {}", format_duration(state.active_ms / 1000))?;
    writeln!(writer, "Paused: {}", format_duration(state.paused_ms / 1000))?;
    writeln!(writer, "Events:")?;
    for event in &events {
        writeln!(
            writer,
            "- {} {} ({})",
            format_timestamp(event.occurred_at),
            event.event_type(),
            event.source
        )?;
    }
    Ok(())
}

fn describe(attempt: &Attempt) -> String {
    format!("{} [{}] {}", attempt.id, attempt.status, attempt.entity_id)
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
