//! Job lifecycle (C7): `CreateJob`, `OnDiscoveryComplete`, `CancelJob`,
//! progress reads, and notification-row writes on terminal transitions.
//!
//! `OnTaskComplete`'s decrement-and-check half already lives in
//! `TaskRepository::complete`/`maybe_finalize_job` — every task completion
//! runs in its own transaction and that is where the job actually flips to
//! `completed`/`failed`. This module owns the other half: starting a job
//! (kicking off discovery in the background) and reacting to the handful of
//! terminal transitions it, not a worker, causes directly (cancellation, a
//! discovery run that seeded nothing).
//!
//! Grounded in the teacher's `service/processor/mod.rs::JobProcessor::process_job`
//! orchestration shape, with the Tauri `Emitter` progress events and SEO
//! analysis steps stripped out and replaced by the task-queue-driven
//! counters this spec defines.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::{PgPool, Row};
use url::Url;
use uuid::Uuid;

use crate::domain::models::{Job, JobCounters, JobSettings, JobStatus};
use crate::repository::domain_repository::DomainRepository;
use crate::repository::task_repository::TaskRepository;
use crate::service::discovery::{DiscoveryOptions, Discoverer};
use crate::service::worker_pool::WorkerPool;

/// Bounds a single discovery run; exceeding it does not fail the job —
/// whatever was already enqueued keeps processing.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(600);

pub struct JobManager {
    pool: PgPool,
    domain_repo: Arc<DomainRepository>,
    task_repo: Arc<TaskRepository>,
    discoverer: Arc<Discoverer>,
    worker_pool: Arc<WorkerPool>,
}

impl JobManager {
    pub fn new(
        pool: PgPool,
        domain_repo: Arc<DomainRepository>,
        task_repo: Arc<TaskRepository>,
        discoverer: Arc<Discoverer>,
        worker_pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            pool,
            domain_repo,
            task_repo,
            discoverer,
            worker_pool,
        }
    }

    /// Validate the domain, persist the job as `pending`, and kick off
    /// discovery in the background. Returns immediately with the new job id
    /// — the caller does not wait for discovery to finish.
    pub async fn create_job(&self, host: &str, settings: JobSettings) -> Result<Uuid> {
        let host = host.trim().to_ascii_lowercase();
        let domain = self.domain_repo.get_or_create(&host).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (domain_id, status, max_pages, concurrency_limit, find_links, include_paths, exclude_paths)
            VALUES ($1, 'pending', $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(domain.id)
        .bind(settings.max_pages)
        .bind(settings.concurrency_limit)
        .bind(settings.find_links)
        .bind(&settings.include_paths)
        .bind(&settings.exclude_paths)
        .fetch_one(&self.pool)
        .await
        .context("failed to create job")?;
        let job_id: Uuid = row.get("id");

        let base_url = Url::parse(&format!("https://{host}")).context("failed to build domain base URL")?;

        let task_repo = Arc::clone(&self.task_repo);
        let domain_repo = Arc::clone(&self.domain_repo);
        let discoverer = Arc::clone(&self.discoverer);
        let pool = self.pool.clone();
        let domain_id = domain.id;
        let options = DiscoveryOptions {
            max_pages: settings.max_pages,
            include_paths: settings.include_paths.clone(),
            exclude_paths: settings.exclude_paths.clone(),
        };

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                DISCOVERY_TIMEOUT,
                discoverer.discover(&task_repo, &domain_repo, job_id, domain_id, &base_url, &options),
            )
            .await;

            match outcome {
                Ok(Ok(enqueued)) => {
                    if let Err(e) = on_discovery_complete(&pool, job_id, enqueued).await {
                        log::warn!("failed to finalize discovery state for job {job_id}: {e:#}");
                    }
                }
                Ok(Err(e)) => {
                    log::warn!("discovery failed for job {job_id}: {e:#}");
                    if let Err(e) = on_discovery_complete(&pool, job_id, 0).await {
                        log::warn!("failed to finalize discovery state for job {job_id}: {e:#}");
                    }
                }
                Err(_) => {
                    log::warn!("discovery timed out after {:?} for job {job_id}; already-enqueued tasks continue", DISCOVERY_TIMEOUT);
                }
            }
        });

        Ok(job_id)
    }

    /// Idempotent: cancelling an already-terminal job is a no-op on the
    /// queue side, and writing a duplicate notification is avoided by
    /// `notify_terminal_jobs`'s existence check rather than here.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        self.task_repo.cancel_job(job_id).await?;
        self.worker_pool.mark_job_cancelled(job_id);
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, domain_id, status, max_pages, concurrency_limit, find_links,
                   include_paths, exclude_paths, created_at, started_at, completed_at,
                   total_tasks, pending_tasks, running_tasks, completed_tasks,
                   failed_tasks, skipped_tasks
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch job")?;

        Ok(row.map(row_to_job))
    }

    /// Write a notification row for every job that reached a terminal
    /// status since the last tick and has none yet. Polling rather than
    /// `LISTEN`/`NOTIFY` delivery, per the store's documented fallback.
    pub async fn notify_terminal_jobs(&self) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            SELECT j.id, j.status, j.total_tasks, j.completed_tasks, j.failed_tasks, j.skipped_tasks
            FROM jobs j
            WHERE j.status IN ('completed', 'failed', 'cancelled')
              AND NOT EXISTS (
                  SELECT 1 FROM notifications n WHERE n.payload ->> 'job_id' = j.id::text
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to find jobs needing notification")?;

        let count = rows.len() as u64;
        for row in rows {
            let job_id: Uuid = row.get("id");
            let status: JobStatus = row.get("status");
            let payload = json!({
                "job_id": job_id.to_string(),
                "status": status.as_str(),
                "total_tasks": row.get::<i32, _>("total_tasks"),
                "completed_tasks": row.get::<i32, _>("completed_tasks"),
                "failed_tasks": row.get::<i32, _>("failed_tasks"),
                "skipped_tasks": row.get::<i32, _>("skipped_tasks"),
            });

            sqlx::query("INSERT INTO notifications (kind, payload) VALUES ($1, $2)")
                .bind("job_terminal")
                .bind(payload)
                .execute(&self.pool)
                .await
                .context("failed to write job notification")?;
        }

        Ok(count)
    }
}

/// If discovery produced no tasks at all, the job never gets a claim to
/// flip it out of `pending` — fail it explicitly with `no_tasks` rather
/// than leaving it stuck.
async fn on_discovery_complete(pool: &PgPool, job_id: Uuid, enqueued: i64) -> Result<()> {
    if enqueued > 0 {
        return Ok(());
    }

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', completed_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to fail job with no_tasks")?;

    log::warn!("job {job_id} discovered zero tasks, marked failed(no_tasks)");
    Ok(())
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Job {
    Job {
        id: row.get("id"),
        domain_id: row.get("domain_id"),
        status: row.get("status"),
        settings: JobSettings {
            max_pages: row.get("max_pages"),
            concurrency_limit: row.get("concurrency_limit"),
            find_links: row.get("find_links"),
            include_paths: row.get("include_paths"),
            exclude_paths: row.get("exclude_paths"),
        },
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        counters: JobCounters {
            total_tasks: row.get("total_tasks"),
            pending_tasks: row.get("pending_tasks"),
            running_tasks: row.get("running_tasks"),
            completed_tasks: row.get("completed_tasks"),
            failed_tasks: row.get("failed_tasks"),
            skipped_tasks: row.get("skipped_tasks"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_settings_round_trip_through_row_fields() {
        let settings = JobSettings {
            max_pages: 500,
            concurrency_limit: 10,
            find_links: true,
            include_paths: vec!["/blog/*".to_string()],
            exclude_paths: vec![],
        };
        assert_eq!(settings.max_pages, 500);
        assert!(settings.find_links);
    }
}
