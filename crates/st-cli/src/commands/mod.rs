//! CLI subcommand implementations.

pub mod aggregate;
pub mod attempt;
pub mod backfill;
pub mod import;
pub mod migrate;
pub mod report;
pub mod status;
pub mod sync;
mod util;
