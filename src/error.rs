//! Error types for the cache-warming engine.
//!
//! - `CrawlError`: the taxonomy a worker branches on to decide retry/backoff.
//! - `Result<T>`: alias for `Result<T, CrawlError>`, used at the worker/service
//!   boundary. Repository and other internal code returns `anyhow::Result`
//!   directly and is converted into `CrawlError::Other` at that boundary.

use thiserror::Error;

/// Errors a crawl attempt can terminate with.
///
/// Every terminal task failure records one of these as `error_kind` plus a
/// free-text `error_message`. The kind alone determines whether the worker
/// retries and with how much backoff.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Upstream responded 401/403/429/503: treat as rate limiting or a WAF.
    #[error("blocked: {0}")]
    Blocked(String),

    /// The task deadline or the HTTP client timeout elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Network reset, DNS failure, or a non-503 5xx: worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// 404/410, malformed URL, or a response the engine will never succeed
    /// against. Not retried.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The job was cancelled, or the pool is draining.
    #[error("cancelled")]
    Cancelled,

    /// No database connection available within budget. Never counts against
    /// a task's retry budget.
    #[error("busy: {0}")]
    Busy(String),

    /// Anything else, propagated from lower layers.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// Stable short name, stored in `tasks.error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Blocked(_) => "blocked",
            Self::Timeout(_) => "timeout",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Cancelled => "cancelled",
            Self::Busy(_) => "busy",
            Self::Other(_) => "other",
        }
    }

    /// Whether this kind of failure is worth retrying at all. `Permanent`
    /// and `Cancelled` never are; `Busy` is handled by the caller backing
    /// off and is not counted as a task retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Blocked(_) | Self::Timeout(_) | Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;
