use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket_notify::api::{self, AppState};
use docket_notify::config::Config;
use docket_notify::db::Database;
use docket_notify::dispatch::{NotificationDispatcher, TracingDispatcher, WebhookDispatcher};
use docket_notify::jobs::{JobOutcome, UrgentTaskJob, URGENT_TASKS_JOB};
use docket_notify::scheduler;

#[derive(Parser)]
#[command(name = "docket")]
#[command(about = "Deadline and status-change notifications for an IP matter docket")]
struct Cli {
    /// Append logs to this file instead of stdout (overrides DOCKET_LOG_FILE)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Port for HTTP API
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Also run the daily urgent-task job in this process
        #[arg(long)]
        schedule: bool,
    },
    /// Run the urgent-task notification job once and exit
    SendUrgentNotifications {
        /// Evaluate deadlines as of this instant (RFC 3339); defaults to now
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Run the urgent-task job every day at DOCKET_SCHEDULE_AT (in DOCKET_TIMEZONE) until Ctrl-C
    Schedule,
    /// Show recent job runs
    Runs {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Apply database migrations and exit
    Migrate,
}

/// Initialize tracing to stdout, or appending to `log_file`.
fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "docket_notify=info,tower_http=info".into()),
    );

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    let db = match &config.db_path {
        Some(path) => Database::open(path.clone())?,
        None => Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

fn build_dispatcher(config: &Config) -> anyhow::Result<Arc<dyn NotificationDispatcher>> {
    let dispatcher: Arc<dyn NotificationDispatcher> = match &config.webhook_url {
        Some(url) => {
            tracing::info!(%url, "delivering notifications via webhook");
            Arc::new(WebhookDispatcher::new(url.clone(), config.io_timeout)?)
        }
        None => {
            tracing::info!("no DOCKET_WEBHOOK_URL set, notifications are only logged");
            Arc::new(TracingDispatcher)
        }
    };
    Ok(dispatcher)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            trigger.cancel();
        }
    });
    token
}

async fn serve(config: &Config, port: u16, schedule: bool) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let state = AppState::new(db, build_dispatcher(config)?, config);
    let shutdown = shutdown_on_ctrl_c();

    if schedule {
        tokio::spawn(scheduler::run_daily(
            state.job.clone(),
            config.schedule_at,
            config.zone,
            shutdown.clone(),
        ));
    }

    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("docket API listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let log_file = cli.log_file.clone().or_else(|| config.log_file.clone());
    init_tracing(log_file.as_deref())?;

    match cli.command {
        Some(Commands::Serve { port, schedule }) => serve(&config, port, schedule).await?,
        Some(Commands::SendUrgentNotifications { as_of }) => {
            let db = open_database(&config)?;
            let job = UrgentTaskJob::new(db, build_dispatcher(&config)?, &config);
            let as_of = as_of.unwrap_or_else(Utc::now);

            match job.run(as_of, &shutdown_on_ctrl_c()).await? {
                JobOutcome::Skipped => {
                    println!("{}: skipped, a previous run still holds the lock", URGENT_TASKS_JOB);
                }
                JobOutcome::Completed(entry) => {
                    println!("{}", serde_json::to_string_pretty(&entry)?);
                }
            }
        }
        Some(Commands::Schedule) => {
            let db = open_database(&config)?;
            let job = Arc::new(UrgentTaskJob::new(db, build_dispatcher(&config)?, &config));
            scheduler::run_daily(job, config.schedule_at, config.zone, shutdown_on_ctrl_c()).await;
        }
        Some(Commands::Runs { limit }) => {
            let db = open_database(&config)?;
            for entry in db.get_run_log(None, limit)? {
                println!(
                    "{}  {:<24} scanned={} urgent={} overdue={} notified={} skipped={} failed={}",
                    entry.started_at.to_rfc3339(),
                    entry.outcome.as_str(),
                    entry.counts.scanned,
                    entry.counts.urgent,
                    entry.counts.overdue,
                    entry.counts.notified,
                    entry.counts.skipped,
                    entry.counts.failed,
                );
                for failure in &entry.counts.failures {
                    println!("    {}: {}", failure.recipient, failure.reason);
                }
            }
        }
        Some(Commands::Migrate) => {
            open_database(&config)?;
            println!("Database is up to date");
        }
        None => serve(&config, 3000, false).await?,
    }

    Ok(())
}
