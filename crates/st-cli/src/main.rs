use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use st_cli::commands::{aggregate, attempt, backfill, import, migrate, report, status, sync};
use st_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(st_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = st_db::Database::open(&config.database_path).context("failed to open database")?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // try_init so a subscriber installed elsewhere doesn't panic
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let (mut db, config) = open_database(cli.config.as_deref())?;
    let mut stdout = std::io::stdout().lock();
    let now = Utc::now();

    match command {
        Commands::Attempt(action) => attempt::run(&mut stdout, &mut db, &config, action, now)?,
        Commands::Sync => {
            sync::run(&mut stdout, &mut db, &config)?;
        }
        Commands::Import(args) => {
            let stdin = std::io::stdin().lock();
            import::run(stdin, &mut stdout, &db, args, &config)?;
        }
        Commands::Backfill => {
            backfill::run(&mut stdout, &mut db, &config)?;
        }
        Commands::Migrate => {
            migrate::run(&mut stdout, &mut db)?;
        }
        Commands::Aggregate(args) => {
            aggregate::run(&mut stdout, &mut db, &config, args, now)?;
        }
        Commands::Report(args) => {
            report::run(&mut stdout, &mut db, &config, args, now)?;
        }
        Commands::Status => status::run(&mut stdout, &db, &config)?,
    }

    Ok(())
}
