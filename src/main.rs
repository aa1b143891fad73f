//! Process entry point: config load, pool + migrations, construction of the
//! job manager / worker pool / maintenance loop, and a signal-driven
//! graceful drain.
//!
//! Generalised from the teacher's `lifecycle.rs::{init_logging, setup,
//! handle_run_event}` (Tauri `RunEvent` handling) into a plain
//! `tokio::signal`-driven shutdown, since there is no app shell here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use cache_warmer::config::Config;
use cache_warmer::db;
use cache_warmer::repository::{DomainRepository, TaskRepository};
use cache_warmer::service::crawler::Crawler;
use cache_warmer::service::discovery::Discoverer;
use cache_warmer::service::http;
use cache_warmer::service::job_manager::JobManager;
use cache_warmer::service::maintenance::MaintenanceLoop;
use cache_warmer::service::rate_limiter::RateLimiter;
use cache_warmer::service::worker_pool::{WorkerPool, WorkerPoolConfig};

/// How long the pool waits for in-flight workers to finish once a shutdown
/// signal arrives, before exiting anyway.
const DRAIN_WINDOW: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "cache_warmer", about = "CDN cache-warming engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool, discovery, and maintenance loop. Default.
    Serve,
    /// Connect and run pending migrations, then exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let pool = db::init_db(&config.database_url).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            log::info!("migrations applied, exiting");
            return Ok(());
        }
        Command::Serve => {}
    }

    let domain_repo = Arc::new(DomainRepository::new(pool.clone()));
    let task_repo = Arc::new(TaskRepository::new(pool.clone()));
    let rate_limiter = Arc::new(RateLimiter::new());

    let http_client = http::create_client(config.default_request_timeout)?;
    let crawler = Arc::new(Crawler::new(http_client.clone()));
    let discoverer = Arc::new(Discoverer::new(http_client, http::USER_AGENT.to_string()));

    let worker_pool = Arc::new(WorkerPool::new(
        Arc::clone(&task_repo),
        Arc::clone(&domain_repo),
        Arc::clone(&crawler),
        Arc::clone(&rate_limiter),
        WorkerPoolConfig {
            base_workers: config.worker_pool_size,
            max_workers: config.worker_pool_size.max(config.max_workers_per_job),
            task_timeout: config.default_task_timeout,
        },
    ));

    let job_manager = Arc::new(JobManager::new(
        pool.clone(),
        Arc::clone(&domain_repo),
        Arc::clone(&task_repo),
        Arc::clone(&discoverer),
        Arc::clone(&worker_pool),
    ));

    let maintenance = MaintenanceLoop::new(
        Arc::clone(&task_repo),
        Arc::clone(&job_manager),
        Arc::clone(&rate_limiter),
        config.maintenance_interval,
        config.stuck_task_threshold,
    );

    let maintenance_shutdown = CancellationToken::new();
    let maintenance_handle = {
        let shutdown = maintenance_shutdown.clone();
        tokio::spawn(async move { maintenance.run(&shutdown).await })
    };

    let mut workers = Arc::clone(&worker_pool).run();

    log::info!(
        "cache_warmer serving with {} base workers",
        config.worker_pool_size
    );

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining workers (window {DRAIN_WINDOW:?})");

    worker_pool.shutdown();
    maintenance_shutdown.cancel();

    let drained = tokio::time::timeout(DRAIN_WINDOW, async {
        while workers.join_next().await.is_some() {}
    })
    .await;

    let _ = maintenance_handle.await;

    match drained {
        Ok(()) => {
            log::info!("clean drain complete");
            Ok(())
        }
        Err(_) => {
            log::warn!("drain window elapsed with workers still in flight; exiting anyway");
            std::process::exit(1);
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
