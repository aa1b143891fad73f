//! Worker pool (C6): a fixed base of claim/crawl/complete loops plus a
//! transient "boost" allowance under observed backlog, all gated by a
//! semaphore and a single `CancellationToken` for graceful drain.
//!
//! Grounded in the `AdaptiveWorkerPoolConfig`/`WorkerPool` shape from this
//! corpus's worker-pool example (`Semaphore` + `AtomicUsize` + `JoinSet` +
//! `CancellationToken`), combined with the teacher's per-job cancellation
//! flag map (`DashMap<String, Arc<AtomicBool>>` in `job_processor_v2.rs`)
//! for job-level (as opposed to pool-wide) cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::domain::models::{SourceType, TaskOutcome};
use crate::error::CrawlError;
use crate::repository::domain_repository::DomainRepository;
use crate::repository::task_repository::{EnqueueItem, TaskRepository};
use crate::service::crawler::{WarmOptions, WarmsUrls};
use crate::service::rate_limiter::RateLimiter;

/// How long a worker waits for new work before polling again, when
/// `ClaimNext` returns nothing.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Exponential backoff cap for blocked/transient retries.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const MAX_BLOCKED_RETRIES: i32 = 2;
const MAX_TRANSIENT_RETRIES: i32 = 3;

pub struct WorkerPoolConfig {
    pub base_workers: usize,
    pub max_workers: usize,
    pub task_timeout: Duration,
}

pub struct WorkerPool {
    task_repo: Arc<TaskRepository>,
    domain_repo: Arc<DomainRepository>,
    crawler: Arc<dyn WarmsUrls>,
    rate_limiter: Arc<RateLimiter>,
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    /// Per-job cancellation, checked by workers before claiming work for a
    /// cancelled job so they don't keep pulling tasks from it needlessly.
    cancelled_jobs: Arc<DashMap<Uuid, ()>>,
}

impl WorkerPool {
    pub fn new(
        task_repo: Arc<TaskRepository>,
        domain_repo: Arc<DomainRepository>,
        crawler: Arc<dyn WarmsUrls>,
        rate_limiter: Arc<RateLimiter>,
        config: WorkerPoolConfig,
    ) -> Self {
        let max_workers = config.max_workers;
        Self {
            task_repo,
            domain_repo,
            crawler,
            rate_limiter,
            config,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
            cancelled_jobs: Arc::new(DashMap::new()),
        }
    }

    pub fn mark_job_cancelled(&self, job_id: Uuid) {
        self.cancelled_jobs.insert(job_id, ());
    }

    /// Spawn `base_workers` loops. Returns a handle the caller awaits to
    /// know when every worker has exited (after `shutdown()` is called and
    /// the drain window elapses).
    pub fn run(self: Arc<Self>) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for worker_id in 0..self.config.base_workers {
            let pool = Arc::clone(&self);
            set.spawn(async move { pool.worker_loop(format!("worker-{worker_id}")).await });
        }
        set
    }

    /// Request graceful shutdown: workers finish their in-flight task then
    /// exit rather than claiming new work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn worker_loop(&self, worker_id: String) {
        loop {
            if self.shutdown.is_cancelled() {
                log::info!("{worker_id} draining, exiting claim loop");
                return;
            }

            let Ok(_permit) = self.semaphore.clone().try_acquire_owned() else {
                tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                continue;
            };

            match self.task_repo.claim_next(&worker_id).await {
                Ok(Some(task)) => {
                    if self.cancelled_jobs.contains_key(&task.job_id) {
                        let _ = self.task_repo.complete(task.id, TaskOutcome::Skipped).await;
                        continue;
                    }
                    self.active.fetch_add(1, Ordering::SeqCst);
                    self.execute_task(&worker_id, task).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                }
                Err(e) => {
                    log::warn!("{worker_id} failed to claim task: {e:#}");
                    tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn execute_task(&self, worker_id: &str, task: crate::domain::models::Task) {
        let task_ctx = CancellationToken::new();
        let job_cancel = self.shutdown.clone();
        let link_job_id = task.job_id;
        let link_domain_hint = task.host.clone();

        let url = match Url::parse(&format!("https://{}{}", task.host, task.path)) {
            Ok(u) => u,
            Err(e) => {
                let _ = self
                    .task_repo
                    .complete(
                        task.id,
                        TaskOutcome::Failed {
                            error_kind: "permanent",
                            error_message: format!("invalid task URL: {e}"),
                            status_code: None,
                        },
                    )
                    .await;
                return;
            }
        };

        // Tear the request down the instant either the worker pool drains
        // or the per-task deadline elapses, not just when the job is
        // cancelled after the fact.
        let deadline = tokio::time::sleep(self.config.task_timeout);
        tokio::pin!(deadline);

        tokio::select! {
            _ = &mut deadline => {
                task_ctx.cancel();
            }
            _ = job_cancel.cancelled() => {
                task_ctx.cancel();
            }
            result = self.run_crawl(&url, &task, &task_ctx) => {
                self.finish_task(worker_id, &task, result, link_job_id, &link_domain_hint).await;
                return;
            }
        }

        // Deadline or shutdown fired first: give the cancelled crawl a brief
        // moment to unwind, then record the outcome ourselves.
        let outcome = CrawlError::Timeout("task deadline exceeded".to_string());
        self.record_failure(&task, outcome).await;
    }

    async fn run_crawl(
        &self,
        url: &Url,
        task: &crate::domain::models::Task,
        task_ctx: &CancellationToken,
    ) -> crate::error::Result<crate::service::crawler::CrawlResult> {
        let min_interval = Duration::from_secs(task.crawl_delay_seconds.max(0) as u64);
        self.rate_limiter
            .wait(url.host_str().unwrap_or_default(), min_interval, task_ctx)
            .await
            .map_err(|_| CrawlError::Cancelled)?;

        self.crawler
            .warm_url(url, &WarmOptions { find_links: task.find_links, referer: None }, task_ctx)
            .await
    }

    async fn finish_task(
        &self,
        worker_id: &str,
        task: &crate::domain::models::Task,
        result: crate::error::Result<crate::service::crawler::CrawlResult>,
        job_id: Uuid,
        host: &str,
    ) {
        match result {
            Ok(crawl) => {
                log::debug!(
                    "{worker_id} warmed {}{} -> {} ({:?}, {}ms)",
                    host,
                    task.path,
                    crawl.status_code,
                    crawl.cache_status,
                    crawl.response_ms
                );
                let _ = self
                    .task_repo
                    .complete(
                        task.id,
                        TaskOutcome::Success {
                            status_code: crawl.status_code as i32,
                            response_ms: crawl.response_ms as i32,
                            cache_status: crawl.cache_status,
                        },
                    )
                    .await;

                if !crawl.discovered_links.is_empty() {
                    self.reenqueue_links(job_id, host, crawl.discovered_links).await;
                }
            }
            Err(err) => self.record_failure(task, err).await,
        }
    }

    async fn record_failure(&self, task: &crate::domain::models::Task, err: CrawlError) {
        let retries_exhausted = match &err {
            CrawlError::Blocked(_) => task.retry_count >= MAX_BLOCKED_RETRIES,
            CrawlError::Timeout(_) | CrawlError::Transient(_) => task.retry_count >= MAX_TRANSIENT_RETRIES,
            _ => true,
        };

        if err.is_retriable() && !retries_exhausted {
            let delay = backoff_for(task.retry_count);
            let _ = self.task_repo.retry(task.id, delay, err.kind()).await;
        } else {
            let _ = self
                .task_repo
                .complete(
                    task.id,
                    TaskOutcome::Failed {
                        error_kind: err.kind(),
                        error_message: err.to_string(),
                        status_code: None,
                    },
                )
                .await;
        }
    }

    async fn reenqueue_links(&self, job_id: Uuid, host: &str, links: Vec<String>) {
        let domain = match self.domain_id_for_host(host).await {
            Some(id) => id,
            None => return,
        };

        let items: Vec<EnqueueItem> = links
            .into_iter()
            .filter_map(|link| {
                let url = Url::parse(&link).ok()?;
                Some(EnqueueItem {
                    page: crate::domain::models::NewPage {
                        path: url.path().to_string(),
                        priority_score: 0.3,
                        discovered_from: SourceType::Link,
                    },
                    source_url: Some(link),
                })
            })
            .collect();

        if !items.is_empty() {
            if let Err(e) = self.task_repo.enqueue_batch(job_id, domain, items).await {
                log::warn!("failed to re-enqueue discovered links for job {job_id}: {e:#}");
            }
        }
    }

    /// Looks up the domain row id for a host. By the time a task is
    /// claimed, the job manager has already created the domain row, so
    /// this is a point lookup rather than a fallible creation path.
    async fn domain_id_for_host(&self, host: &str) -> Option<Uuid> {
        match self.domain_repo.get_by_name(host).await {
            Ok(domain) => domain.map(|d| d.id),
            Err(e) => {
                log::warn!("failed to look up domain {host} for link re-enqueue: {e:#}");
                None
            }
        }
    }
}

fn backoff_for(retry_count: i32) -> Duration {
    let secs = 2u64.saturating_pow(retry_count.max(0) as u32);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_secs(1));
        assert_eq!(backoff_for(1), Duration::from_secs(2));
        assert_eq!(backoff_for(2), Duration::from_secs(4));
        assert_eq!(backoff_for(10), MAX_BACKOFF);
    }
}
