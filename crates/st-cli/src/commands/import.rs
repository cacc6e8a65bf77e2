//! Import command for loading completion logs into the local `SQLite` store.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;

use st_core::{CompletionFact, SessionKind};
use st_db::Database;

use crate::Config;

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// User to apply when incoming logs omit `user_id`.
    #[arg(long)]
    pub user: Option<String>,
}

/// Counts from one import run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub already: usize,
    /// Logs of a type that is not a completion.
    pub ignored: usize,
}

pub fn run<R: BufRead, W: Write>(
    reader: R,
    writer: &mut W,
    db: &Database,
    args: &ImportArgs,
    config: &Config,
) -> Result<ImportSummary> {
    let default_user = args.user.as_deref().unwrap_or(&config.user_id);
    let (logs, ignored) = parse_logs(reader, default_user)?;

    let mut summary = ImportSummary {
        ignored,
        ..ImportSummary::default()
    };
    for log in &logs {
        if db.record_completion_log(log)? {
            summary.imported += 1;
        } else {
            summary.already += 1;
        }
    }

    writeln!(
        writer,
        "Imported {} completion logs ({} already present, {} ignored)",
        summary.imported, summary.already, summary.ignored
    )?;
    Ok(summary)
}

/// Parses JSONL completion logs. Returns the logs and how many lines had a
/// non-completion type.
fn parse_logs<R: BufRead>(reader: R, default_user: &str) -> Result<(Vec<CompletionFact>, usize)> {
    let mut logs = Vec::new();
    let mut ignored = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed: ImportLog = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON on line {}", idx + 1))?;
        match parsed
            .into_fact(default_user)
            .with_context(|| format!("invalid log on line {}", idx + 1))?
        {
            Some(fact) => logs.push(fact),
            None => ignored += 1,
        }
    }
    Ok((logs, ignored))
}

#[derive(Debug, Deserialize)]
struct ImportLog {
    id: String,
    timestamp: String,
    #[serde(rename = "type")]
    log_type: String,
    #[serde(default, alias = "data")]
    payload: serde_json::Value,
    #[serde(default, alias = "userId")]
    user_id: Option<String>,
    #[serde(default, alias = "isUndone")]
    is_undone: bool,
}

impl ImportLog {
    fn into_fact(self, default_user: &str) -> Result<Option<CompletionFact>> {
        if self.id.trim().is_empty() {
            return Err(anyhow::anyhow!("missing id"));
        }
        if self.timestamp.trim().is_empty() {
            return Err(anyhow::anyhow!("missing timestamp"));
        }
        let Some(kind) = SessionKind::from_log_type(self.log_type.trim()) else {
            return Ok(None);
        };
        let user_id = self
            .user_id
            .filter(|user| !user.trim().is_empty())
            .unwrap_or_else(|| default_user.to_string());
        Ok(Some(CompletionFact {
            id: self.id,
            user_id,
            timestamp: self.timestamp,
            kind,
            payload: self.payload,
            is_undone: self.is_undone,
        }))
    }
}
