//! # Studio Credits Main Entry Point
//!
//! `studio-credits serve` (the default) applies pending migrations and serves the
//! API; `studio-credits migrate` only applies migrations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use studio_credits::{
    config::ConfigLoader,
    db::{init_pool, run_migrations},
    server::run_server,
    telemetry::init_tracing,
};

#[derive(Parser)]
#[command(name = "studio-credits")]
#[command(about = "Credit ledger and job reconciliation service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations, then serve the HTTP API
    Serve,
    /// Apply pending migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    init_tracing(&config).context("initializing telemetry")?;

    match config.redacted_json() {
        Ok(redacted) => tracing::info!(profile = %config.profile, config = %redacted, "Configuration loaded"),
        Err(e) => tracing::warn!(error = %e, "Could not render configuration"),
    }

    let db = init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    run_migrations(&db).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => Ok(()),
        Commands::Serve => run_server(config, db).await,
    }
}
