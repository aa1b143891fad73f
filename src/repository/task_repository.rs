//! The task queue (C2): `EnqueueBatch`, `ClaimNext`, `Complete`, `Retry`,
//! `PromoteWaiting`, `CancelJob`.
//!
//! The claim query is the one genuinely tricky piece: it must pick the
//! highest-priority pending task from a job that still has capacity under
//! its `concurrency_limit`, lock it `SKIP LOCKED` so concurrent workers never
//! double-claim, and do so without scanning every job on every poll. Grounded
//! in the `FOR UPDATE SKIP LOCKED` claim CTE pattern used for Postgres job
//! queues elsewhere in this corpus.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use crate::domain::models::{NewPage, SourceType, Task, TaskOutcome, TaskStatus};

const ENQUEUE_CHUNK_SIZE: usize = 100;

pub struct TaskRepository {
    pool: PgPool,
}

pub struct EnqueueItem {
    pub page: NewPage,
    pub source_url: Option<String>,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert pages and insert one task per newly-created `(job_id, page_id)`
    /// pair. Re-enqueuing an already-known page for the same job is a no-op.
    /// Returns the number of tasks actually inserted.
    pub async fn enqueue_batch(
        &self,
        job_id: Uuid,
        domain_id: Uuid,
        items: Vec<EnqueueItem>,
    ) -> Result<i64> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0i64;

        for chunk in items.chunks(ENQUEUE_CHUNK_SIZE) {
            let mut page_qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO pages (domain_id, path, priority_score, discovered_from) ",
            );
            page_qb.push_values(chunk, |mut b, item: &EnqueueItem| {
                b.push_bind(domain_id)
                    .push_bind(&item.page.path)
                    .push_bind(item.page.priority_score)
                    .push_bind(item.page.discovered_from);
            });
            page_qb.push(
                " ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path RETURNING id",
            );
            let page_ids: Vec<Uuid> = page_qb
                .build()
                .fetch_all(&mut *tx)
                .await
                .context("failed to upsert pages for enqueue")?
                .into_iter()
                .map(|row| row.get("id"))
                .collect();

            let mut task_qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO tasks (job_id, page_id, source_type, source_url, priority_score) ",
            );
            task_qb.push_values(page_ids.iter().zip(chunk), |mut b, (page_id, item)| {
                b.push_bind(job_id)
                    .push_bind(*page_id)
                    .push_bind(item.page.discovered_from)
                    .push_bind(&item.source_url)
                    .push_bind(item.page.priority_score);
            });
            task_qb.push(" ON CONFLICT (job_id, page_id) DO NOTHING");

            let result = task_qb
                .build()
                .execute(&mut *tx)
                .await
                .context("failed to insert tasks for enqueue")?;
            inserted += result.rows_affected() as i64;
        }

        if inserted > 0 {
            sqlx::query(
                "UPDATE jobs SET total_tasks = total_tasks + $1, pending_tasks = pending_tasks + $1 WHERE id = $2",
            )
            .bind(inserted)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .context("failed to update job counters after enqueue")?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Claim the highest-priority pending task from some runnable job, or
    /// `None` if nothing is eligible right now. A job is eligible only while
    /// its `running_tasks` is under `concurrency_limit` (0 = unlimited).
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT t.id
                FROM tasks t
                JOIN jobs j ON j.id = t.job_id
                WHERE t.status = 'pending'
                  AND j.status IN ('pending', 'running')
                  AND (j.concurrency_limit = 0 OR j.running_tasks < j.concurrency_limit)
                ORDER BY t.priority_score DESC, t.created_at ASC
                LIMIT 1
                FOR UPDATE OF t SKIP LOCKED
            )
            UPDATE tasks t
            SET status = 'running', started_at = NOW()
            FROM claimable, pages p, domains d
            WHERE t.id = claimable.id
              AND p.id = t.page_id
              AND d.id = p.domain_id
            RETURNING t.id, t.job_id, t.page_id, t.status, t.retry_count, t.source_type,
                      t.source_url, t.priority_score, t.created_at, t.started_at,
                      t.completed_at, t.ready_at, t.response_ms, t.status_code,
                      t.cache_status, t.error_kind, t.error_message,
                      d.name AS host, p.path AS path,
                      d.robots_crawl_delay_seconds AS crawl_delay_seconds, j.find_links AS find_links
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .context("failed to claim task")?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let job_id: Uuid = row.get("job_id");
        sqlx::query(
            "UPDATE jobs SET running_tasks = running_tasks + 1, pending_tasks = pending_tasks - 1, \
             started_at = COALESCE(started_at, NOW()), status = CASE WHEN status = 'pending' THEN 'running'::job_status ELSE status END \
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("failed to update job counters on claim")?;

        tx.commit().await?;
        log::debug!("worker {worker_id} claimed task {}", row.get::<Uuid, _>("id"));
        Ok(Some(row_to_task(row)))
    }

    /// Record a terminal outcome for a claimed task and roll the job's
    /// counters forward. If this drains the job, advance `jobs.status`.
    pub async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let (new_status, counter_column) = match &outcome {
            TaskOutcome::Success { .. } => (TaskStatus::Completed, "completed_tasks"),
            TaskOutcome::Failed { .. } => (TaskStatus::Failed, "failed_tasks"),
            TaskOutcome::Skipped => (TaskStatus::Skipped, "skipped_tasks"),
        };

        match &outcome {
            TaskOutcome::Success {
                status_code,
                response_ms,
                cache_status,
            } => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = $1, completed_at = NOW(), status_code = $2,
                        response_ms = $3, cache_status = $4
                    WHERE id = $5
                    "#,
                )
                .bind(new_status)
                .bind(status_code)
                .bind(response_ms)
                .bind(cache_status.as_str())
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .context("failed to mark task completed")?;
            }
            TaskOutcome::Failed {
                error_kind,
                error_message,
                status_code,
            } => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = $1, completed_at = NOW(), error_kind = $2,
                        error_message = $3, status_code = $4
                    WHERE id = $5
                    "#,
                )
                .bind(new_status)
                .bind(*error_kind)
                .bind(error_message)
                .bind(status_code)
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .context("failed to mark task failed")?;
            }
            TaskOutcome::Skipped => {
                sqlx::query("UPDATE tasks SET status = $1, completed_at = NOW() WHERE id = $2")
                    .bind(new_status)
                    .bind(task_id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to mark task skipped")?;
            }
        }

        let job_id: Uuid = sqlx::query("SELECT job_id FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to look up task's job")?
            .get("job_id");

        let sql = format!(
            "UPDATE jobs SET running_tasks = running_tasks - 1, {counter_column} = {counter_column} + 1 WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .context("failed to update job counters on complete")?;

        maybe_finalize_job(&mut tx, job_id).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move a task back to `waiting`, to become claimable again after `delay`.
    pub async fn retry(&self, task_id: Uuid, delay: std::time::Duration, reason: &str) -> Result<()> {
        let ready_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'waiting', ready_at = $1, retry_count = retry_count + 1,
                error_kind = $2
            WHERE id = $3
            "#,
        )
        .bind(ready_at)
        .bind(reason)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark task waiting")?;

        let job_id: Uuid = sqlx::query("SELECT job_id FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to look up task's job")?
            .get("job_id");

        sqlx::query("UPDATE jobs SET running_tasks = running_tasks - 1 WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .context("failed to update job counters on retry")?;

        tx.commit().await?;
        Ok(())
    }

    /// Move every `waiting` task whose `ready_at` has passed back to
    /// `pending`. Returns the number promoted.
    pub async fn promote_waiting(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending'
            WHERE status = 'waiting' AND ready_at <= $1
            RETURNING job_id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .context("failed to promote waiting tasks")?;

        for job_id in rows.iter().map(|r| r.get::<Uuid, _>("job_id")) {
            sqlx::query("UPDATE jobs SET pending_tasks = pending_tasks + 1 WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .context("failed to update job counters on promotion")?;
        }

        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    /// Cancel a job: mark it `cancelled` and skip every non-terminal task.
    /// Idempotent — re-cancelling an already-cancelled job changes nothing.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let skipped = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'skipped', completed_at = NOW()
            WHERE job_id = $1 AND status IN ('pending', 'running', 'waiting')
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("failed to skip tasks on cancel")?
        .rows_affected() as i32;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = NOW(),
                pending_tasks = 0, running_tasks = 0,
                skipped_tasks = skipped_tasks + $1
            WHERE id = $2 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(skipped)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark job cancelled")?;

        tx.commit().await?;
        Ok(())
    }

    /// Reset tasks stuck in `running` past `threshold` back to `pending`
    /// (used by the maintenance loop, C8). Process death is not counted as
    /// a task-level retry, so `retry_count` is untouched.
    pub async fn reclaim_stuck(&self, threshold: std::time::Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_default();

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', started_at = NULL
            WHERE status = 'running' AND started_at < $1
            RETURNING job_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .context("failed to reclaim stuck tasks")?;

        for job_id in rows.iter().map(|r| r.get::<Uuid, _>("job_id")) {
            sqlx::query(
                "UPDATE jobs SET running_tasks = running_tasks - 1, pending_tasks = pending_tasks + 1 WHERE id = $1",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .context("failed to update job counters on reclaim")?;
        }

        tx.commit().await?;
        if !rows.is_empty() {
            log::warn!("reclaimed {} stuck tasks", rows.len());
        }
        Ok(rows.len() as u64)
    }
}

/// If a job has no pending/running/waiting tasks left, advance it to its
/// terminal status. Runs inside the caller's transaction.
async fn maybe_finalize_job(tx: &mut Transaction<'_, Postgres>, job_id: Uuid) -> Result<()> {
    let row = sqlx::query(
        "SELECT status, total_tasks, pending_tasks, running_tasks, failed_tasks FROM jobs WHERE id = $1 FOR UPDATE",
    )
    .bind(job_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to load job for finalize check")?;

    let status: crate::domain::models::JobStatus = row.get("status");
    if status.is_terminal() {
        return Ok(());
    }

    let pending: i32 = row.get("pending_tasks");
    let running: i32 = row.get("running_tasks");
    if pending > 0 || running > 0 {
        return Ok(());
    }

    // `waiting` tasks have no counter of their own (they're a scheduled
    // retry, not a bucket `jobs` tracks), so the drained check above can't
    // see them. A job must not finalize while one is still scheduled to
    // come back via `promote_waiting` — once the job is terminal, the claim
    // query's `j.status IN ('pending', 'running')` filter would orphan it.
    let has_waiting: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE job_id = $1 AND status = 'waiting')",
    )
    .bind(job_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to check for waiting tasks before finalizing")?;
    if has_waiting {
        return Ok(());
    }

    let total: i32 = row.get("total_tasks");
    let failed: i32 = row.get("failed_tasks");
    let failure_ratio = if total == 0 { 1.0 } else { failed as f64 / total as f64 };
    let final_status = if total == 0 || failure_ratio > crate::domain::models::JOB_FAILURE_THRESHOLD {
        crate::domain::models::JobStatus::Failed
    } else {
        crate::domain::models::JobStatus::Completed
    };

    sqlx::query("UPDATE jobs SET status = $1, completed_at = NOW() WHERE id = $2")
        .bind(final_status)
        .bind(job_id)
        .execute(&mut **tx)
        .await
        .context("failed to finalize job")?;

    Ok(())
}

fn row_to_task(row: sqlx::postgres::PgRow) -> Task {
    Task {
        id: row.get("id"),
        job_id: row.get("job_id"),
        page_id: row.get("page_id"),
        status: row.get("status"),
        retry_count: row.get("retry_count"),
        source_type: row.get::<SourceType, _>("source_type"),
        source_url: row.get("source_url"),
        priority_score: row.get("priority_score"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        ready_at: row.get("ready_at"),
        response_ms: row.get("response_ms"),
        status_code: row.get("status_code"),
        cache_status: row.get("cache_status"),
        error_kind: row.get("error_kind"),
        error_message: row.get("error_message"),
        host: row.get("host"),
        path: row.get("path"),
        crawl_delay_seconds: row.get("crawl_delay_seconds"),
        find_links: row.get("find_links"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_item_carries_source_url_through() {
        let item = EnqueueItem {
            page: NewPage {
                path: "/about".into(),
                priority_score: 0.5,
                discovered_from: SourceType::Link,
            },
            source_url: Some("https://example.com/".into()),
        };
        assert_eq!(item.source_url.as_deref(), Some("https://example.com/"));
    }
}
