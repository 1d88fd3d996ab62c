//! Memgate CLI - operational surface for the memory write gateway.

use anyhow::Context;
use chrono::Duration;
use clap::{Parser, Subcommand};
use memgate_database::Database;
use memgate_outbox::{
    run_reconcile, DeliveryConfig, HttpDeliveryClient, OutboxWorker, ReconcileConfig, WorkerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Memgate - policy-gated memory write gateway.
#[derive(Parser)]
#[command(name = "memgate")]
#[command(about = "Operational commands for the memory write gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pool of outbox workers until interrupted
    Worker {
        /// Path to the gateway database
        #[arg(long, env = "MEMGATE_DB")]
        db: PathBuf,

        /// Base URL of the downstream memory store
        #[arg(long, env = "MEMGATE_TARGET_URL")]
        target_url: String,

        /// Bearer token for the downstream store
        #[arg(long, env = "MEMGATE_AUTH_TOKEN")]
        auth_token: Option<String>,

        /// Number of concurrent workers
        #[arg(long, default_value = "2")]
        workers: usize,

        /// Records claimed per batch
        #[arg(long, default_value = "16")]
        batch_size: usize,

        /// Lease duration in minutes
        #[arg(long, default_value = "5")]
        lease_minutes: i64,

        /// Retryable failures beyond this count mark a record dead
        #[arg(long, default_value = "10")]
        max_retries: u32,

        /// Delay between claim attempts in milliseconds
        #[arg(long, default_value = "500")]
        poll_interval_ms: u64,
    },

    /// Run one reconciliation pass and exit 0 (clean), 1 (repaired), or 2 (errors)
    Reconcile {
        /// Path to the gateway database
        #[arg(long, env = "MEMGATE_DB")]
        db: PathBuf,

        /// How far back to scan for terminal records without audit, in hours
        #[arg(long, default_value = "24")]
        scan_window_hours: i64,

        /// Leases held longer than this are released, in minutes
        #[arg(long, default_value = "30")]
        stale_lease_minutes: i64,

        /// Pending audit rows older than this are failed, in minutes
        #[arg(long, default_value = "15")]
        pending_audit_minutes: i64,

        /// Report what would be repaired without writing anything
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(true)
        .compact()
        .init();
}

async fn run_workers(
    db_path: PathBuf,
    target_url: String,
    auth_token: Option<String>,
    workers: usize,
    config: WorkerConfig,
) -> anyhow::Result<()> {
    let db = Arc::new(Database::open(&db_path).context("failed to open database")?);
    let delivery = Arc::new(
        HttpDeliveryClient::new(DeliveryConfig {
            base_url: target_url,
            auth_token,
            ..Default::default()
        })
        .context("failed to build delivery client")?,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let worker = OutboxWorker::new(db.clone(), delivery.clone(), config.clone());
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }
    info!(workers, "Worker pool started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Worker {
            db,
            target_url,
            auth_token,
            workers,
            batch_size,
            lease_minutes,
            max_retries,
            poll_interval_ms,
        } => {
            let config = WorkerConfig {
                batch_size,
                lease_duration: Duration::minutes(lease_minutes),
                max_retries,
                poll_interval: std::time::Duration::from_millis(poll_interval_ms),
                ..Default::default()
            };
            run_workers(db, target_url, auth_token, workers, config).await?;
            Ok(0)
        }
        Commands::Reconcile {
            db,
            scan_window_hours,
            stale_lease_minutes,
            pending_audit_minutes,
            dry_run,
        } => {
            let config = ReconcileConfig {
                scan_window: Duration::hours(scan_window_hours),
                stale_lease_threshold: Duration::minutes(stale_lease_minutes),
                pending_audit_timeout: Duration::minutes(pending_audit_minutes),
                dry_run,
            };
            let report = run_reconcile(&db, config).context("reconciliation failed")?;
            println!(
                "reconcile: status={} repaired={} skipped={} failed={}",
                report.status().as_str(),
                report.repaired,
                report.skipped,
                report.failed
            );
            Ok(report.status().exit_code())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}
