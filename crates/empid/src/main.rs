//! empid, the EMPI matching daemon.
//!
//! `worker` runs the scheduler loop that drains pending import jobs through
//! the matcher; `migrate` applies the schema migrations and exits.

mod config;
mod health;
mod matching_service;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use empi_matcher::{ExactMatchLinker, InProcessJobRunner, Matcher};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::info;

use config::WorkerConfig;
use health::DaemonStatus;
use matching_service::MatchingService;
use metrics::MatcherMetrics;

#[derive(Parser)]
#[command(name = "empid", about = "EMPI matching daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the matching worker loop
    Worker,
    /// Apply schema migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => migrate().await,
        Commands::Worker => worker().await,
    }
}

async fn migrate() -> Result<()> {
    let config = WorkerConfig::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database_url)
        .await?;

    empi_db::run_migrations(&pool).await?;
    info!("Migrations applied");
    Ok(())
}

async fn worker() -> Result<()> {
    let config = WorkerConfig::from_env()?;
    info!("Starting empid worker {}", config.worker_id);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    info!("Connected to database");

    let matcher_metrics = MatcherMetrics::new();

    let status = Arc::new(DaemonStatus {
        worker_id: config.worker_id.clone(),
        metrics: matcher_metrics.clone(),
    });

    // Start status/metrics HTTP server
    let metrics_port = config.metrics_port;
    let status_router = health::status_router(status);
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", metrics_port);
        info!("Status server listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, status_router).await.unwrap();
    });

    // First Ctrl+C drains the loop; the second exits immediately.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, stopping gracefully. Press Ctrl+C again to stop immediately");
        cancel_tx.send(true).ok();
        tokio::signal::ctrl_c().await.ok();
        info!("Second Ctrl+C received, stopping immediately");
        std::process::exit(1);
    });

    let matcher = Matcher::new(pool.clone(), Arc::new(ExactMatchLinker));
    let runner = Arc::new(InProcessJobRunner::new(matcher));

    let service = MatchingService::new(
        pool,
        runner,
        matcher_metrics,
        Duration::from_secs(config.poll_interval_secs),
        cancel_rx,
    );
    service.run().await
}
