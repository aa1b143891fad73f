//! Queue-level integration tests against a real, migrated Postgres
//! database. The direct generalisation of the teacher's `setup_test_db()`
//! in-memory-SQLite fixture to a server-backed store: `#[sqlx::test]` spins
//! up an ephemeral database per test, applies `./migrations`, and tears it
//! down afterward.

use cache_warmer::domain::models::{JobStatus, NewPage, SourceType, TaskOutcome, TaskStatus};
use cache_warmer::repository::task_repository::{EnqueueItem, TaskRepository};
use cache_warmer::repository::DomainRepository;
use sqlx::{PgPool, Row};

async fn seed_job(pool: &PgPool, domain_id: uuid::Uuid, max_pages: i32, concurrency_limit: i32) -> uuid::Uuid {
    let row = sqlx::query(
        "INSERT INTO jobs (domain_id, status, max_pages, concurrency_limit, find_links) \
         VALUES ($1, 'pending', $2, $3, false) RETURNING id",
    )
    .bind(domain_id)
    .bind(max_pages)
    .bind(concurrency_limit)
    .fetch_one(pool)
    .await
    .unwrap();
    row.get("id")
}

fn item(path: &str) -> EnqueueItem {
    EnqueueItem {
        page: NewPage {
            path: path.to_string(),
            priority_score: 0.5,
            discovered_from: SourceType::Sitemap,
        },
        source_url: Some(format!("https://example.com{path}")),
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn enqueue_batch_is_idempotent_on_job_and_page(pool: PgPool) {
    let domains = DomainRepository::new(pool.clone());
    let domain = domains.get_or_create("example.com").await.unwrap();
    let tasks = TaskRepository::new(pool.clone());
    let job_id = seed_job(&pool, domain.id, 100, 0).await;

    let first = tasks
        .enqueue_batch(job_id, domain.id, vec![item("/"), item("/about")])
        .await
        .unwrap();
    assert_eq!(first, 2);

    let second = tasks
        .enqueue_batch(job_id, domain.id, vec![item("/"), item("/about")])
        .await
        .unwrap();
    assert_eq!(second, 0);

    let total: i32 = sqlx::query("SELECT total_tasks FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("total_tasks");
    assert_eq!(total, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn claim_next_respects_concurrency_limit(pool: PgPool) {
    let domains = DomainRepository::new(pool.clone());
    let domain = domains.get_or_create("limited.example").await.unwrap();
    let tasks = TaskRepository::new(pool.clone());
    let job_id = seed_job(&pool, domain.id, 100, 1).await;

    tasks
        .enqueue_batch(job_id, domain.id, vec![item("/a"), item("/b")])
        .await
        .unwrap();

    let first = tasks.claim_next("worker-1").await.unwrap();
    assert!(first.is_some());

    // concurrency_limit = 1 and one task already running: nothing else claimable.
    let second = tasks.claim_next("worker-2").await.unwrap();
    assert!(second.is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn complete_drains_job_to_completed_when_all_tasks_succeed(pool: PgPool) {
    let domains = DomainRepository::new(pool.clone());
    let domain = domains.get_or_create("done.example").await.unwrap();
    let tasks = TaskRepository::new(pool.clone());
    let job_id = seed_job(&pool, domain.id, 100, 0).await;

    tasks.enqueue_batch(job_id, domain.id, vec![item("/")]).await.unwrap();
    let task = tasks.claim_next("worker-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);

    tasks
        .complete(
            task.id,
            TaskOutcome::Success {
                status_code: 200,
                response_ms: 120,
                cache_status: cache_warmer::domain::models::CacheStatus::Hit,
            },
        )
        .await
        .unwrap();

    let status: JobStatus = sqlx::query("SELECT status FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("status");
    assert_eq!(status, JobStatus::Completed);
}

#[sqlx::test(migrations = "./migrations")]
async fn cancel_job_is_idempotent_and_skips_pending_tasks(pool: PgPool) {
    let domains = DomainRepository::new(pool.clone());
    let domain = domains.get_or_create("cancel.example").await.unwrap();
    let tasks = TaskRepository::new(pool.clone());
    let job_id = seed_job(&pool, domain.id, 100, 0).await;

    tasks
        .enqueue_batch(job_id, domain.id, vec![item("/a"), item("/b"), item("/c")])
        .await
        .unwrap();

    tasks.cancel_job(job_id).await.unwrap();
    tasks.cancel_job(job_id).await.unwrap(); // idempotent

    let row = sqlx::query("SELECT status, pending_tasks, skipped_tasks FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let status: JobStatus = row.get("status");
    assert_eq!(status, JobStatus::Cancelled);
    assert_eq!(row.get::<i32, _>("pending_tasks"), 0);
    assert_eq!(row.get::<i32, _>("skipped_tasks"), 3);
}

#[sqlx::test(migrations = "./migrations")]
async fn retried_task_is_not_claimable_before_its_delay_elapses(pool: PgPool) {
    let domains = DomainRepository::new(pool.clone());
    let domain = domains.get_or_create("retry.example").await.unwrap();
    let tasks = TaskRepository::new(pool.clone());
    let job_id = seed_job(&pool, domain.id, 100, 0).await;

    tasks.enqueue_batch(job_id, domain.id, vec![item("/")]).await.unwrap();
    let task = tasks.claim_next("worker-1").await.unwrap().unwrap();

    tasks
        .retry(task.id, std::time::Duration::from_secs(3600), "transient")
        .await
        .unwrap();

    let nothing = tasks.claim_next("worker-2").await.unwrap();
    assert!(nothing.is_none());

    let promoted = tasks.promote_waiting(chrono::Utc::now()).await.unwrap();
    assert_eq!(promoted, 0); // ready_at is an hour out, not due yet
}
