//! Sync command for exchanging events with the configured remote.

use std::io::Write;

use anyhow::{Context, Result};

use st_db::Database;
use st_sync::{HttpRemote, RemoteExchange, SyncEngine, SyncReport};

use crate::Config;

pub fn run<W: Write>(writer: &mut W, db: &mut Database, config: &Config) -> Result<SyncReport> {
    let url = config
        .remote_url
        .as_deref()
        .context("no remote configured; set remote_url in the config file or ST_REMOTE_URL")?;
    let remote = HttpRemote::new(url, config.remote_token.clone())
        .with_context(|| format!("failed to set up remote {url}"))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(sync_with(writer, db, &SyncEngine::new(remote)))
}

/// Runs one round with `engine` and prints its summary.
pub async fn sync_with<W: Write, R: RemoteExchange>(
    writer: &mut W,
    db: &mut Database,
    engine: &SyncEngine<R>,
) -> Result<SyncReport> {
    let report = engine.sync_all(db).await.context("sync failed")?;
    if report.skipped {
        writeln!(writer, "Nothing to sync.")?;
    } else {
        writeln!(
            writer,
            "Synced: sent {}, received {} ({} new), {} conflicts resolved",
            report.sent, report.received, report.inserted, report.conflicts
        )?;
    }
    Ok(report)
}
