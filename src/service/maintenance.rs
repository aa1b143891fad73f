//! Maintenance loop (C8): periodic reconciliation that heals the system
//! without depending on any worker being alive to notice the problem.
//!
//! Grounded in the timer-driven `reclaim_expired`/`cleanup_succeeded`
//! pattern from this corpus's Postgres job-queue example — a plain
//! `tokio::time::interval` loop around already-transactional repository
//! operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::repository::task_repository::TaskRepository;
use crate::service::job_manager::JobManager;
use crate::service::rate_limiter::RateLimiter;

/// Rate-limiter entries idle longer than this are evicted on every tick.
const RATE_LIMITER_IDLE_THRESHOLD: Duration = Duration::from_secs(3600);

pub struct MaintenanceLoop {
    task_repo: Arc<TaskRepository>,
    job_manager: Arc<JobManager>,
    rate_limiter: Arc<RateLimiter>,
    interval: Duration,
    stuck_task_threshold: Duration,
}

impl MaintenanceLoop {
    pub fn new(
        task_repo: Arc<TaskRepository>,
        job_manager: Arc<JobManager>,
        rate_limiter: Arc<RateLimiter>,
        interval: Duration,
        stuck_task_threshold: Duration,
    ) -> Self {
        Self {
            task_repo,
            job_manager,
            rate_limiter,
            interval,
            stuck_task_threshold,
        }
    }

    /// Run until `shutdown` fires. Each tick's failures are logged and
    /// swallowed — a bad tick must not take the loop down, since nothing
    /// else in the system performs this reconciliation.
    pub async fn run(&self, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_once().await,
                _ = shutdown.cancelled() => {
                    log::info!("maintenance loop shutting down");
                    return;
                }
            }
        }
    }

    pub async fn run_once(&self) {
        match self.task_repo.reclaim_stuck(self.stuck_task_threshold).await {
            Ok(0) => {}
            Ok(n) => log::warn!("maintenance: reclaimed {n} stuck tasks"),
            Err(e) => log::error!("maintenance: failed to reclaim stuck tasks: {e:#}"),
        }

        match self.task_repo.promote_waiting(Utc::now()).await {
            Ok(0) => {}
            Ok(n) => log::debug!("maintenance: promoted {n} waiting tasks to pending"),
            Err(e) => log::error!("maintenance: failed to promote waiting tasks: {e:#}"),
        }

        match self.job_manager.notify_terminal_jobs().await {
            Ok(0) => {}
            Ok(n) => log::debug!("maintenance: wrote {n} job-terminal notifications"),
            Err(e) => log::error!("maintenance: failed to notify terminal jobs: {e:#}"),
        }

        self.rate_limiter.cleanup(RATE_LIMITER_IDLE_THRESHOLD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_threshold_is_one_hour() {
        assert_eq!(RATE_LIMITER_IDLE_THRESHOLD, Duration::from_secs(3600));
    }
}
