//! Domain entities: `Domain`, `Page`, `Job`, `Task`.
//!
//! `Job` owns a tree of `Task`s (one per `Page`); counters on `Job` are kept
//! in sync incrementally by the task repository rather than recomputed with
//! `COUNT(*)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// DOMAIN
// ============================================================================

/// A crawlable host and its cached robots.txt policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub name: String,
    pub robots_raw: Option<String>,
    pub robots_sitemap_urls: Vec<String>,
    pub robots_disallows: Vec<String>,
    pub robots_crawl_delay_seconds: i32,
    pub robots_fetched_at: Option<DateTime<Utc>>,
}

impl Domain {
    /// Minimum gap enforced between requests to this host, regardless of
    /// what robots.txt says.
    pub fn min_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.robots_crawl_delay_seconds.max(1) as u64)
    }

    /// robots.txt is considered stale after this long and should be re-fetched.
    pub fn is_robots_stale(&self, refresh_after: chrono::Duration) -> bool {
        match self.robots_fetched_at {
            Some(fetched) => Utc::now() - fetched > refresh_after,
            None => true,
        }
    }
}

// ============================================================================
// PAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "source_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Sitemap,
    Link,
    Seed,
    Fallback,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sitemap => "sitemap",
            Self::Link => "link",
            Self::Seed => "seed",
            Self::Fallback => "fallback",
        }
    }
}

/// A URL belonging to a domain, origin-relative (`path` starts with `/`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub path: String,
    pub priority_score: f64,
    pub discovered_from: SourceType,
    pub created_at: DateTime<Utc>,
}

/// A page not yet inserted, as produced by discovery/link extraction.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub path: String,
    pub priority_score: f64,
    pub discovered_from: SourceType,
}

// ============================================================================
// JOB
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Crawl policy for one cache-warming run, supplied by the caller at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    pub max_pages: i32,
    pub concurrency_limit: i32,
    pub find_links: bool,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_pages: 100,
            concurrency_limit: 0,
            find_links: false,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
        }
    }
}

/// Running totals kept in sync with every task transition.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounters {
    pub total_tasks: i32,
    pub pending_tasks: i32,
    pub running_tasks: i32,
    pub completed_tasks: i32,
    pub failed_tasks: i32,
    pub skipped_tasks: i32,
}

impl JobCounters {
    /// A job is fully drained once no task remains pending, running, or
    /// waiting on a retry. Only then may `OnTaskComplete` close the job.
    pub fn is_drained(&self) -> bool {
        self.pending_tasks == 0 && self.running_tasks == 0
    }
}

/// One cache-warming run for a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub status: JobStatus,
    pub settings: JobSettings,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: JobCounters,
}

/// Fraction of tasks permitted to fail before the job itself is `failed`
/// rather than `completed`.
pub const JOB_FAILURE_THRESHOLD: f64 = 0.5;

impl Job {
    /// Final status once the job is fully drained: `failed` if more than
    /// `JOB_FAILURE_THRESHOLD` of tasks failed (or every task failed),
    /// `completed` otherwise.
    pub fn terminal_status(&self) -> JobStatus {
        let c = &self.counters;
        if c.total_tasks == 0 {
            return JobStatus::Failed;
        }
        let failure_ratio = c.failed_tasks as f64 / c.total_tasks as f64;
        if failure_ratio > JOB_FAILURE_THRESHOLD {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }
}

// ============================================================================
// TASK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Cache-status values recognised from CDN response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Expired,
    Stale,
    Revalidated,
    Bypass,
    Dynamic,
    None,
    Unknown,
}

impl CacheStatus {
    /// Whether this status is worth re-probing to confirm the cache warmed.
    pub fn is_warmable(&self) -> bool {
        matches!(self, Self::Miss | Self::Expired)
    }

    pub fn from_header_value(v: &str) -> Self {
        match v.to_ascii_uppercase().as_str() {
            "HIT" => Self::Hit,
            "MISS" => Self::Miss,
            "EXPIRED" => Self::Expired,
            "STALE" => Self::Stale,
            "REVALIDATED" => Self::Revalidated,
            "BYPASS" => Self::Bypass,
            "DYNAMIC" => Self::Dynamic,
            "NONE" => Self::None,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Expired => "EXPIRED",
            Self::Stale => "STALE",
            Self::Revalidated => "REVALIDATED",
            Self::Bypass => "BYPASS",
            Self::Dynamic => "DYNAMIC",
            Self::None => "NONE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One planned fetch against a page, owned by exactly one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub page_id: Uuid,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub priority_score: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub response_ms: Option<i32>,
    pub status_code: Option<i32>,
    pub cache_status: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    // Denormalised, needed by the worker to rate-limit and identify the
    // URL to fetch without a join back through `pages`/`domains`.
    pub host: String,
    pub path: String,
    // Denormalised from `domains`/`jobs` at claim time so the worker can
    // honour the domain's crawl-delay and the job's `find_links` flag
    // without a second round-trip to the store.
    pub crawl_delay_seconds: i32,
    pub find_links: bool,
}

/// Outcome of executing a claimed task, handed to `TaskRepository::complete`.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success {
        status_code: i32,
        response_ms: i32,
        cache_status: CacheStatus,
    },
    Failed {
        error_kind: &'static str,
        error_message: String,
        status_code: Option<i32>,
    },
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_all_failed_is_failed() {
        let job = Job {
            id: Uuid::new_v4(),
            domain_id: Uuid::new_v4(),
            status: JobStatus::Running,
            settings: JobSettings::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            counters: JobCounters {
                total_tasks: 5,
                pending_tasks: 0,
                running_tasks: 0,
                completed_tasks: 0,
                failed_tasks: 5,
                skipped_tasks: 0,
            },
        };
        assert_eq!(job.terminal_status(), JobStatus::Failed);
    }

    #[test]
    fn terminal_status_majority_success_is_completed() {
        let job = Job {
            id: Uuid::new_v4(),
            domain_id: Uuid::new_v4(),
            status: JobStatus::Running,
            settings: JobSettings::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            counters: JobCounters {
                total_tasks: 10,
                pending_tasks: 0,
                running_tasks: 0,
                completed_tasks: 8,
                failed_tasks: 2,
                skipped_tasks: 0,
            },
        };
        assert_eq!(job.terminal_status(), JobStatus::Completed);
    }

    #[test]
    fn cache_status_warmable_only_on_miss_or_expired() {
        assert!(CacheStatus::Miss.is_warmable());
        assert!(CacheStatus::Expired.is_warmable());
        assert!(!CacheStatus::Bypass.is_warmable());
        assert!(!CacheStatus::Dynamic.is_warmable());
        assert!(!CacheStatus::Hit.is_warmable());
    }

    #[test]
    fn cache_status_parses_known_header_values() {
        assert_eq!(CacheStatus::from_header_value("hit"), CacheStatus::Hit);
        assert_eq!(CacheStatus::from_header_value("BYPASS"), CacheStatus::Bypass);
        assert_eq!(CacheStatus::from_header_value("weird"), CacheStatus::Unknown);
    }
}
